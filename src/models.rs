//! Catalog of known text and image models.

use serde::Serialize;

/// API name of the text model used when none is chosen.
pub const DEFAULT_TEXT_MODEL: &str = "gpt-3.5-turbo";

/// API name of the image model used when none is chosen.
pub const DEFAULT_IMAGE_MODEL: &str = "stabilityai/stable-diffusion-2-1";

/// A selectable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Model {
    /// Identifier sent to the collaborator.
    pub api_name: &'static str,
    /// Name shown to people.
    pub human_name: &'static str,
    pub available: bool,
}

impl Model {
    const fn new(api_name: &'static str, human_name: &'static str) -> Self {
        Self {
            api_name,
            human_name,
            available: true,
        }
    }
}

pub const GPT_35_TURBO: Model = Model::new("gpt-3.5-turbo", "GPT 3.5 Turbo");
pub const GPT_4: Model = Model::new("gpt-4", "GPT 4");

pub const TEXT_MODELS: &[Model] = &[GPT_35_TURBO, GPT_4];

pub const IMAGE_MODELS: &[Model] = &[
    Model::new("CompVis/stable-diffusion-v1-4", "Stable Diffusion 1.4"),
    Model::new("runwayml/stable-diffusion-v1-5", "Stable Diffusion 1.5"),
    Model::new("stabilityai/stable-diffusion-2-1", "Stable Diffusion 2.1"),
    Model::new(
        "stabilityai/stable-diffusion-2-1-base",
        "Stable Diffusion 2.1 Base",
    ),
    Model::new(
        "sd-dreambooth-library/herge-style",
        "Stable Diffusion Herge Style",
    ),
];

/// Shown for a stored model name that is no longer in the catalog.
pub const UNKNOWN_MODEL: Model = Model {
    api_name: "_unknown",
    human_name: "???",
    available: false,
};

/// Look up a text model by API name.
pub fn find_text_model(api_name: &str) -> Option<&'static Model> {
    TEXT_MODELS.iter().find(|m| m.api_name == api_name)
}

/// Look up an image model by API name.
pub fn find_image_model(api_name: &str) -> Option<&'static Model> {
    IMAGE_MODELS.iter().find(|m| m.api_name == api_name)
}

pub mod bfl;
pub mod common;
pub mod google;
pub mod ideogram;
pub mod minimax;
pub mod openai_images;
pub mod reve;
pub mod stability;

pub use bfl::BflFlux;
pub use common::ProviderHttp;
pub use google::{GeminiImage, Imagen};
pub use ideogram::Ideogram;
pub use minimax::Minimax;
pub use openai_images::OpenAIImages;
pub use reve::Reve;
pub use stability::StabilityCore;

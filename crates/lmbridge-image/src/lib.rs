mod cache;
mod download;
mod filebed;
mod optimize;
mod pipeline;

pub use cache::ProcessedImageCache;
pub use download::{ImageDownloader, save_image_locally};
pub use filebed::{FilebedUploader, HttpImageHost, ImageHost};
pub use optimize::{DecodedImage, decode_base64_image, image_to_data_uri, mime_for_format, optimize_image};
pub use pipeline::ImagePipeline;

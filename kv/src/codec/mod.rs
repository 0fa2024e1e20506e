pub mod json_codec;
pub mod bytes_codec;
pub mod batch_codec;

/// Define a codec type and implement the Codec trait
pub trait Codec {
    fn codec_name<T>(&self) -> String;
}

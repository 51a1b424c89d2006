mod bitmap;

pub use self::bitmap::Bitmap;

pub mod gop;

pub use gop::GopBuffer;

mod byte_stream;
mod work_dir;

pub use byte_stream::ByteStream;
pub use work_dir::WorkDir;

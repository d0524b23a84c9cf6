pub mod binding;
pub mod codec;
pub mod descriptor;

pub use binding::RouteBinding;
pub use codec::{CodecKind, RouteCodec};
pub use descriptor::RouteDescriptor;

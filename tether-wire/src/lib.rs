pub mod mac;
pub mod nd;
pub mod ra;

pub use mac::MacAddr;
pub use nd::{NdCodec, NdMessage, RouterAdvert};
pub use ra::{DeprecatedInfo, IpPrefix, RaParams};

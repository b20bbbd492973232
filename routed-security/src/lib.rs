pub mod cidr;
pub mod config;
pub mod cookies;
pub mod filter;
pub mod proxy;

pub use cidr::{any_contains, parse_list, Cidr, InvalidCidr};
pub use config::{IpFilterConfig, TrustedProxiesConfig};
pub use cookies::{CodecMode, CookieCodec, DecodeError};
pub use filter::{FilterAction, IpFilter};
pub use proxy::{ProxyResolver, DEFAULT_FORWARDED_HEADERS};

pub mod prelude {
    pub use crate::cidr::Cidr;
    pub use crate::cookies::{CodecMode, CookieCodec};
    pub use crate::filter::{FilterAction, IpFilter};
    pub use crate::proxy::ProxyResolver;
}

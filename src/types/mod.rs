pub mod af;
pub mod errors;
pub mod route;

pub use af::AddressFamily;
pub(crate) use route::{parse_prefix, parse_route_spec};

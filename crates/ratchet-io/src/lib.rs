mod config;
mod dns;
mod process;
mod socket;
mod tls;

pub use config::ResolverConfig;
pub use dns::{Resolver, normalize_ptr_query};
pub use process::{Process, Stream};
pub use socket::{AddressFamily, Socket};
pub use tls::TlsSession;

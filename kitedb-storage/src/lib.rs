pub mod bitmap;
pub mod chunk;
pub mod column;
pub mod compression;
pub mod config;
pub mod error;
pub mod group;
pub mod page;
pub mod serde;
pub mod vector;
pub mod version;

pub mod prelude {
    pub use crate::chunk::*;
    pub use crate::column::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::group::csr::*;
    pub use crate::group::*;
    pub use crate::page::*;
    pub use crate::vector::*;
    pub use crate::version::*;
}

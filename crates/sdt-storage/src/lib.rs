//! sdt-storage: OpenDAL S3 operator + multipart part store

pub mod error;
pub mod multipart;
pub mod operator;

pub use multipart::{part_checksum, MultipartStore, OpendalStore, PartReceipt};
pub use operator::{build_operator, object_key, Credentials, StorageConfig};

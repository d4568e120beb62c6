//! Package domain entities.

pub mod model;
pub mod naming;
pub mod upload_info;

pub use model::{NewPackage, Package, PackageStatus};
pub use naming::PackageFileType;
pub use upload_info::{ChunkPosition, ResumeToken, TransferState, UploadInfo, UploadedPart};

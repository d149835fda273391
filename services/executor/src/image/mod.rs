//! OCI image materialization and rootfs artifact building.

pub mod init;
pub mod preparer;

pub use preparer::{artifact_file_name, DockerImagePreparer, ImageError, ImagePreparer};

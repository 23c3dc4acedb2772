pub mod events;
pub mod remote;
pub mod reporter;
pub mod sources;
pub mod uploader;

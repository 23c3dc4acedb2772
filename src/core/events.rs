use std::fmt;

/// A file handed to the upload worker: the persisted `path` plus the URL Uploadcare fetches.
///
/// For URL-list sources both are the same string; for S3 the URL is a presigned link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub url: String,
    pub size: Option<i64>,
}

impl FileRef {
    pub fn new(path: impl Into<String>, url: impl Into<String>, size: Option<i64>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            size,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            path: url.clone(),
            url,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SubmitFailed,
    SubmitAccepted,
    DownloadFailed,
    DownloadComplete,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::SubmitFailed,
        EventKind::SubmitAccepted,
        EventKind::DownloadFailed,
        EventKind::DownloadComplete,
    ];

    /// Kinds that end a file's lifecycle for the current run.
    pub const TERMINAL: [EventKind; 3] = [
        EventKind::SubmitFailed,
        EventKind::DownloadFailed,
        EventKind::DownloadComplete,
    ];

    pub const FAILURES: [EventKind; 2] = [EventKind::SubmitFailed, EventKind::DownloadFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubmitFailed => "UPLOAD_ERROR",
            EventKind::SubmitAccepted => "UPLOAD_COMPLETE",
            EventKind::DownloadFailed => "DOWNLOAD_ERROR",
            EventKind::DownloadComplete => "DOWNLOAD_COMPLETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event published by the upload worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// `from_url` rejected the file or could not be reached.
    SubmitFailed { file: FileRef, error: String },
    /// `from_url` accepted the file; a download outcome follows.
    SubmitAccepted { file: FileRef, token: String },
    /// Uploadcare reported an error, the status check failed, or it timed out.
    DownloadFailed { file: FileRef, error: String },
    DownloadComplete { file: FileRef, remote_id: String },
}

impl UploadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::SubmitFailed { .. } => EventKind::SubmitFailed,
            UploadEvent::SubmitAccepted { .. } => EventKind::SubmitAccepted,
            UploadEvent::DownloadFailed { .. } => EventKind::DownloadFailed,
            UploadEvent::DownloadComplete { .. } => EventKind::DownloadComplete,
        }
    }

    pub fn file(&self) -> &FileRef {
        match self {
            UploadEvent::SubmitFailed { file, .. }
            | UploadEvent::SubmitAccepted { file, .. }
            | UploadEvent::DownloadFailed { file, .. }
            | UploadEvent::DownloadComplete { file, .. } => file,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            UploadEvent::SubmitFailed { error, .. } | UploadEvent::DownloadFailed { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadEvent::SubmitAccepted { .. })
    }
}

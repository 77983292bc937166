//! Folder-backed request handler: object push and folder browsing over a root directory.

use std::fmt::Write as _;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use obex_core::{HeaderSet, ResponseCode};
use uuid::Uuid;

use crate::server::{RequestHandler, ServerOperation, DEFAULT_MAX_OBJECT_SIZE};

/// Target of the OBEX folder-browsing service.
pub const FOLDER_BROWSING: Uuid = Uuid::from_u128(0xF9EC7BC4_953C_11D2_984E_525400DC9E09);

pub const FOLDER_LISTING_TYPE: &str = "x-obex/folder-listing";

/// Files are read and written with blocking `std::fs` calls from the session
/// task; `max_object_size` bounds how much one call moves.
pub struct FolderHandler {
    root: PathBuf,
    current: PathBuf,
    allow_create: bool,
    max_object_size: u64,
}

impl FolderHandler {
    pub fn new(root: impl Into<PathBuf>, allow_create: bool) -> Self {
        let root = root.into();
        Self {
            current: root.clone(),
            root,
            allow_create,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }

    /// Files larger than this are not served.
    pub fn with_max_object_size(mut self, limit: u64) -> Self {
        self.max_object_size = limit;
        self
    }

    pub fn current_dir(&self) -> &Path {
        &self.current
    }

    /// A child of the current folder. Names that could escape it are refused.
    fn child(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return None;
        }
        Some(self.current.join(name))
    }

    fn listing(&self) -> std::io::Result<String> {
        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if meta.is_dir() {
                folders.push(name);
            } else {
                files.push((name, meta.len()));
            }
        }
        folders.sort();
        files.sort();

        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<!DOCTYPE folder-listing SYSTEM \"obex-folder-listing.dtd\">\n<folder-listing version=\"1.0\">\n",
        );
        if self.current != self.root {
            xml.push_str("  <parent-folder/>\n");
        }
        for name in folders {
            let _ = writeln!(xml, "  <folder name=\"{}\"/>", escape(&name));
        }
        for (name, size) in files {
            let _ = writeln!(xml, "  <file name=\"{}\" size=\"{}\"/>", escape(&name), size);
        }
        xml.push_str("</folder-listing>\n");
        Ok(xml)
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Copy the PUT body into `path`; returns the number of bytes written.
fn store(path: &Path, op: &ServerOperation) -> std::io::Result<u64> {
    let mut file = std::fs::File::create(path)?;
    let mut buf = [0u8; 8192];
    let mut written = 0u64;
    loop {
        let n = op.read(&mut buf).map_err(std::io::Error::other)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        written += n as u64;
    }
    file.flush()?;
    Ok(written)
}

fn io_code(e: &std::io::Error) -> ResponseCode {
    match e.kind() {
        ErrorKind::NotFound => ResponseCode::NOT_FOUND,
        ErrorKind::PermissionDenied => ResponseCode::FORBIDDEN,
        ErrorKind::AlreadyExists => ResponseCode::CONFLICT,
        _ => ResponseCode::INTERNAL_ERROR,
    }
}

impl RequestHandler for FolderHandler {
    fn on_connect(&mut self, request: &HeaderSet, response: &mut HeaderSet) -> ResponseCode {
        if let Some(target) = request.target() {
            if target != FOLDER_BROWSING.as_bytes() {
                return ResponseCode::SERVICE_UNAVAILABLE;
            }
            response.set_who(FOLDER_BROWSING.as_bytes().to_vec());
            response.set_connection_id(rand::random());
        }
        self.current = self.root.clone();
        ResponseCode::SUCCESS
    }

    fn on_put(&mut self, op: &mut ServerOperation) -> ResponseCode {
        let Some(path) = op.name().and_then(|n| self.child(n)) else {
            return ResponseCode::BAD_REQUEST;
        };
        if op.is_delete() {
            let removed = if path.is_dir() {
                std::fs::remove_dir(&path)
            } else {
                std::fs::remove_file(&path)
            };
            return match removed {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "deleted");
                    ResponseCode::SUCCESS
                }
                Err(e) => io_code(&e),
            };
        }
        match store(&path, op) {
            Ok(written) => {
                if let Some(len) = op.length() {
                    if u64::from(len) != written {
                        tracing::warn!(expected = len, got = written, "length header mismatch");
                    }
                }
                tracing::info!(path = %path.display(), len = written, "stored");
                ResponseCode::SUCCESS
            }
            Err(e) => io_code(&e),
        }
    }

    fn on_get(&mut self, op: &mut ServerOperation) -> ResponseCode {
        if op.content_type() == Some(FOLDER_LISTING_TYPE) {
            return match self.listing() {
                Ok(xml) => {
                    op.write(xml.as_bytes());
                    op.response_headers().set_object_length(xml.len() as u64);
                    ResponseCode::SUCCESS
                }
                Err(e) => io_code(&e),
            };
        }
        let Some(path) = op.name().and_then(|n| self.child(n)) else {
            return ResponseCode::BAD_REQUEST;
        };
        let size = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => return ResponseCode::FORBIDDEN,
            Ok(meta) => meta.len(),
            Err(e) => return io_code(&e),
        };
        if size > self.max_object_size {
            tracing::warn!(path = %path.display(), size, limit = self.max_object_size, "file too large to serve");
            return ResponseCode::REQUEST_ENTITY_TOO_LARGE;
        }
        match std::fs::read(&path) {
            Ok(data) => {
                op.response_headers().set_object_length(data.len() as u64);
                op.write(&data);
                ResponseCode::SUCCESS
            }
            Err(e) => io_code(&e),
        }
    }

    fn on_set_path(
        &mut self,
        request: &HeaderSet,
        _response: &mut HeaderSet,
        backup: bool,
        create: bool,
    ) -> ResponseCode {
        let mut target = self.current.clone();
        if backup {
            if self.current == self.root {
                return ResponseCode::NOT_FOUND;
            }
            target.pop();
        }
        match request.name() {
            None | Some("") if !backup => target = self.root.clone(),
            None | Some("") => {}
            Some(name) => {
                if self.child(name).is_none() {
                    return ResponseCode::BAD_REQUEST;
                }
                target.push(name);
                if !target.is_dir() {
                    if !(create && self.allow_create) {
                        return ResponseCode::NOT_FOUND;
                    }
                    if let Err(e) = std::fs::create_dir(&target) {
                        return io_code(&e);
                    }
                }
            }
        }
        tracing::debug!(path = %target.display(), "set path");
        self.current = target;
        ResponseCode::SUCCESS
    }
}

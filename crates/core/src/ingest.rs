use crate::error::SourceError;
use crate::extractor::{DocumentSource, SourceDocument};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every `.pdf` file under `folder`, any case, sorted by path.
pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    files.sort_unstable();
    files
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub error: SourceError,
}

#[derive(Default)]
pub struct FolderLoad {
    pub documents: Vec<SourceDocument>,
    pub skipped: Vec<SkippedFile>,
}

/// Loads every PDF under `folder`. Unreadable files are reported, not fatal.
pub async fn load_folder(source: &dyn DocumentSource, folder: &Path) -> FolderLoad {
    let mut load = FolderLoad::default();
    for path in discover_pdf_files(folder) {
        match source.load(&path).await {
            Ok(document) => load.documents.push(document),
            Err(error) => {
                tracing::warn!(path = %path.display(), reason = %error, "skipped pdf");
                load.skipped.push(SkippedFile { path, error });
            }
        }
    }
    load
}

//! Refs command implementation.

use anyhow::{Context, Result};

use chunkway_core::file::{format_size, FileRef, UploadFile};

use super::RefsArgs;

/// Run the refs command.
pub async fn run(args: RefsArgs) -> Result<()> {
    for path in &args.paths {
        let file = UploadFile::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        println!(
            "{}  {:>10}  {}  {}",
            FileRef::generate(&file),
            format_size(file.size()),
            file.mime_type(),
            path.display()
        );
    }
    Ok(())
}

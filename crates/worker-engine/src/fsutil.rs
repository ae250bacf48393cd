use std::fs;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Byte stream of remote content (bundle payloads, code tarballs).
pub(crate) type ByteStream = futures::stream::BoxStream<'static, std::io::Result<Bytes>>;

/// Decision returned by a progress callback after each copied chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Continue,
    Cancel,
}

/// Result of [`copy_with_progress`], carrying the byte count either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyOutcome {
    Completed(u64),
    Cancelled(u64),
}

/// Copy a byte stream into `dst`, invoking `on_progress` with the running
/// total after every chunk. The callback may return [`Progress::Cancel`] to
/// abort the copy; cancellation is bounded by one chunk.
pub(crate) async fn copy_with_progress<S, W, F>(
    mut src: S,
    dst: &mut W,
    mut on_progress: F,
) -> anyhow::Result<CopyOutcome>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64) -> Progress,
{
    let mut copied: u64 = 0;
    while let Some(chunk) = src.next().await {
        let chunk = chunk?;
        dst.write_all(&chunk).await?;
        copied += chunk.len() as u64;
        if on_progress(copied) == Progress::Cancel {
            return Ok(CopyOutcome::Cancelled(copied));
        }
    }
    dst.flush().await?;
    Ok(CopyOutcome::Completed(copied))
}

/// Remove a file or directory tree, ignoring a path that is already gone.
pub(crate) fn remove_path(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(err) = res {
        log::debug!("failed to remove {}: {err}", path.display());
    }
}

/// Total on-disk byte size of a file or directory tree.
///
/// Symlinks are counted by their own metadata, not followed.
pub(crate) fn path_size(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }

    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

/// Unpack a gzipped tarball into `dest`, creating it first.
pub(crate) fn un_tar_gz(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dest)?;
    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest)?;
    Ok(())
}

/// Pack the contents of `src` into a gzipped tarball at `dest`.
///
/// `dest` must live outside `src` or the archive would include itself.
pub(crate) fn tar_gz_directory(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = fs::File::create(dest)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Resolve `subpath` under `base`, rejecting absolute paths and any
/// component that would escape the base directory.
pub(crate) fn resolve_subpath(base: &Path, subpath: &str) -> anyhow::Result<PathBuf> {
    let mut out = base.to_path_buf();
    for comp in Path::new(subpath).components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => anyhow::bail!("invalid subpath: {subpath:?}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn resolve_subpath_rejects_traversal() {
        let base = Path::new("/work/runs/abc");
        assert!(resolve_subpath(base, "out/data.txt").is_ok());
        assert!(resolve_subpath(base, "./out").is_ok());
        assert!(resolve_subpath(base, "../escape").is_err());
        assert!(resolve_subpath(base, "/etc/passwd").is_err());
        assert!(resolve_subpath(base, "out/../../escape").is_err());
    }

    #[test]
    fn tar_round_trips_a_directory() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("out.tar.gz");
        tar_gz_directory(src.path(), &archive).unwrap();

        let dest = scratch.path().join("unpacked");
        un_tar_gz(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.join("sub/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn path_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        fs::create_dir_all(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/b"), vec![0u8; 32]).unwrap();
        assert_eq!(path_size(dir.path()), 42);
    }

    #[tokio::test]
    async fn copy_with_progress_reports_and_completes() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
        ];
        let mut seen = Vec::new();
        let mut dst = Vec::new();
        let outcome = copy_with_progress(stream::iter(chunks), &mut dst, |n| {
            seen.push(n);
            Progress::Continue
        })
        .await
        .unwrap();

        assert_eq!(outcome, CopyOutcome::Completed(7));
        assert_eq!(seen, vec![3, 7]);
        assert_eq!(dst, b"abcdefg");
    }

    #[tokio::test]
    async fn copy_with_progress_cancels_within_one_chunk() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghi")),
        ];
        let mut dst = Vec::new();
        let outcome = copy_with_progress(stream::iter(chunks), &mut dst, |_| Progress::Cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Cancelled(3));
        assert_eq!(dst, b"abc");
    }
}

#![deny(missing_docs)]
//! Session-state snapshots: allowlisted, traversal-proof gzipped tars.
//!
//! A snapshot carries exactly four subdirectories of the agent home —
//! `workspace/`, `data/`, `output/`, `state/` — across sessions. Anything
//! else is omitted on save and fails the whole operation on restore. The
//! archive format is gzipped tar with member paths relative to the agent
//! home.
//!
//! Restore is where the danger lives: a prior-state blob is
//! agent-influenced data, so [`unpack`] validates the entire archive —
//! absolute paths, `..` components, link entries, out-of-allowlist roots —
//! before extracting a single byte. A rejected entry therefore never
//! leaves a partial restore behind. Snapshots contain regular files and
//! directories only; symlinks are skipped at pack time (with a warning)
//! and rejected at restore time.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use primordial_core::error::SnapshotError;
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};

/// The only subdirectories of the agent home that persist across sessions.
pub const STATE_ALLOWLIST: &[&str] = &["workspace", "data", "output", "state"];

/// Pack the allowlisted subdirectories of `home` into a gzipped tar.
///
/// Preserves file mode and mtime. Subdirectories that do not exist are
/// simply absent from the archive. Symlinks are skipped with a warning —
/// they can point anywhere, and restore would reject them regardless.
pub fn pack(home: &Path) -> Result<Vec<u8>, SnapshotError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for name in STATE_ALLOWLIST {
        let root = home.join(name);
        if !root.is_dir() {
            continue;
        }
        append_dir(&mut builder, home, Path::new(name))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| SnapshotError::Io(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SnapshotError::Io(e.to_string()))
}

fn append_dir(
    builder: &mut Builder<GzEncoder<Vec<u8>>>,
    home: &Path,
    rel: &Path,
) -> Result<(), SnapshotError> {
    let abs = home.join(rel);
    let meta = std::fs::symlink_metadata(&abs).map_err(|e| SnapshotError::Io(e.to_string()))?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    set_meta(&mut header, &meta);
    builder
        .append_data(&mut header, rel, std::io::empty())
        .map_err(|e| SnapshotError::Io(e.to_string()))?;

    let entries = std::fs::read_dir(&abs).map_err(|e| SnapshotError::Io(e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| SnapshotError::Io(e.to_string()))?;
        let child_rel = rel.join(entry.file_name());
        let meta = std::fs::symlink_metadata(entry.path())
            .map_err(|e| SnapshotError::Io(e.to_string()))?;

        if meta.file_type().is_symlink() {
            tracing::warn!(path = %child_rel.display(), "skipping symlink in state snapshot");
            continue;
        }
        if meta.is_dir() {
            append_dir(builder, home, &child_rel)?;
            continue;
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        set_meta(&mut header, &meta);
        let file =
            std::fs::File::open(entry.path()).map_err(|e| SnapshotError::Io(e.to_string()))?;
        builder
            .append_data(&mut header, &child_rel, file)
            .map_err(|e| SnapshotError::Io(e.to_string()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_meta(header: &mut Header, meta: &std::fs::Metadata) {
    use std::os::unix::fs::MetadataExt;
    header.set_mode(meta.mode() & 0o7777);
    header.set_mtime(meta.mtime().max(0) as u64);
}

#[cfg(not(unix))]
fn set_meta(header: &mut Header, meta: &std::fs::Metadata) {
    header.set_mode(0o644);
    if let Ok(modified) = meta.modified() {
        if let Ok(since) = modified.duration_since(std::time::UNIX_EPOCH) {
            header.set_mtime(since.as_secs());
        }
    }
}

/// Why an archive entry failed the safety filter.
fn entry_violation(path: &Path, entry_type: EntryType) -> Option<&'static str> {
    match entry_type {
        EntryType::Regular | EntryType::Directory | EntryType::GNULongName
        | EntryType::GNULongLink | EntryType::XHeader | EntryType::XGlobalHeader => {}
        EntryType::Symlink => return Some("symlink entry"),
        EntryType::Link => return Some("hardlink entry"),
        _ => return Some("unsupported entry type"),
    }

    let mut components = path.components();
    let first = match components.next() {
        None => return Some("empty path"),
        Some(Component::Normal(first)) => first,
        Some(Component::CurDir) => match components.next() {
            Some(Component::Normal(first)) => first,
            _ => return Some("empty path"),
        },
        Some(Component::ParentDir) => return Some("parent-directory traversal"),
        Some(_) => return Some("absolute path"),
    };
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Some("parent-directory traversal");
    }
    if path
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
    {
        return Some("absolute path");
    }
    let Some(first) = first.to_str() else {
        return Some("non-utf8 path");
    };
    if !STATE_ALLOWLIST.contains(&first) {
        return Some("outside the state allowlist");
    }
    None
}

/// Restore a snapshot into `home`, creating the allowlisted
/// subdirectories as needed. Returns the number of files restored.
///
/// The whole archive is validated before anything is extracted; any
/// violation fails the operation with [`SnapshotError::UnsafeEntry`] and
/// leaves `home` untouched.
pub fn unpack(bytes: &[u8], home: &Path) -> Result<usize, SnapshotError> {
    // Pass one: validate every entry. The archive is in memory, so the
    // second read costs one more gzip pass, which is far cheaper than
    // staging a partial extract and rolling it back.
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive
        .entries()
        .map_err(|e| SnapshotError::Malformed(e.to_string()))?
    {
        let entry = entry.map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let entry_type = entry.header().entry_type();
        let path = entry
            .path()
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?
            .into_owned();
        if let Some(reason) = entry_violation(&path, entry_type) {
            return Err(SnapshotError::UnsafeEntry {
                path: path.display().to_string(),
                reason: reason.to_string(),
            });
        }
    }

    // Pass two: extract. unpack_in re-checks containment as a second
    // layer; an entry it refuses at this point is still a hard failure.
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    let mut files = 0usize;
    for entry in archive
        .entries()
        .map_err(|e| SnapshotError::Malformed(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let is_file = entry.header().entry_type() == EntryType::Regular;
        let unpacked = entry
            .unpack_in(home)
            .map_err(|e| SnapshotError::Io(e.to_string()))?;
        if !unpacked {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            return Err(SnapshotError::UnsafeEntry {
                path,
                reason: "refused by extraction filter".to_string(),
            });
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Build a hostile archive with raw tar headers. The `tar` crate's
    /// writer refuses `..` and absolute member names (correctly), so the
    /// attacks restore must reject have to be forged byte-by-byte, the way
    /// an attacker would.
    fn raw_archive(entries: &[(&str, u8, &[u8])]) -> Vec<u8> {
        fn octal(field: &mut [u8], value: u64) {
            let text = format!("{value:0width$o}\0", width = field.len() - 1);
            field.copy_from_slice(text.as_bytes());
        }

        let mut tarball = Vec::new();
        for (name, type_flag, contents) in entries {
            let mut header = [0u8; 512];
            header[..name.len()].copy_from_slice(name.as_bytes());
            octal(&mut header[100..108], 0o644); // mode
            octal(&mut header[108..116], 0); // uid
            octal(&mut header[116..124], 0); // gid
            octal(&mut header[124..136], contents.len() as u64); // size
            octal(&mut header[136..148], 0); // mtime
            header[148..156].fill(b' '); // checksum placeholder
            header[156] = *type_flag;
            if *type_flag == b'2' || *type_flag == b'1' {
                header[157] = b'/'; // link target: filesystem root
            }
            header[257..265].copy_from_slice(b"ustar  \0");
            let sum: u64 = header.iter().map(|&b| b as u64).sum();
            header[148..155].copy_from_slice(format!("{sum:06o}\0").as_bytes());

            tarball.extend_from_slice(&header);
            tarball.extend_from_slice(contents);
            let pad = (512 - contents.len() % 512) % 512;
            tarball.extend(std::iter::repeat_n(0u8, pad));
        }
        tarball.extend(std::iter::repeat_n(0u8, 1024));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn roundtrip_restores_contents_and_modes() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("workspace/notes.md"), b"remember");
        write_file(&src.path().join("data/db.sqlite"), b"\x00\x01");
        write_file(&src.path().join("state/run.json"), b"{}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                src.path().join("workspace/notes.md"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let bytes = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        let files = unpack(&bytes, dst.path()).unwrap();

        assert_eq!(files, 3);
        assert_eq!(
            std::fs::read(dst.path().join("workspace/notes.md")).unwrap(),
            b"remember"
        );
        assert_eq!(std::fs::read(dst.path().join("data/db.sqlite")).unwrap(), b"\x00\x01");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dst.path().join("workspace/notes.md"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn paths_outside_the_allowlist_are_omitted_on_pack() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("workspace/kept.txt"), b"kept");
        write_file(&src.path().join("secrets/dropped.txt"), b"dropped");
        write_file(&src.path().join("stray.txt"), b"dropped");

        let bytes = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack(&bytes, dst.path()).unwrap();

        assert!(dst.path().join("workspace/kept.txt").exists());
        assert!(!dst.path().join("secrets").exists());
        assert!(!dst.path().join("stray.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped_on_pack() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("workspace/real.txt"), b"real");
        std::os::unix::fs::symlink("/etc/passwd", src.path().join("workspace/evil")).unwrap();

        let bytes = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        let files = unpack(&bytes, dst.path()).unwrap();

        assert_eq!(files, 1);
        assert!(!dst.path().join("workspace/evil").exists());
    }

    #[test]
    fn parent_traversal_fails_the_whole_restore() {
        let bytes = raw_archive(&[
            ("workspace/ok.txt", b'0', b"fine"),
            ("workspace/../evil", b'0', b"nope"),
        ]);
        let dst = tempfile::tempdir().unwrap();
        let err = unpack(&bytes, dst.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsafeEntry { ref reason, .. }
            if reason.contains("traversal")));
        // Nothing was extracted, valid entries included.
        assert!(!dst.path().join("workspace/ok.txt").exists());
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let bytes = raw_archive(&[("/etc/passwd", b'0', b"root:x")]);
        let dst = tempfile::tempdir().unwrap();
        let err = unpack(&bytes, dst.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsafeEntry { .. }));
    }

    #[test]
    fn symlink_entries_are_rejected() {
        let bytes = raw_archive(&[("workspace/link", b'2', b"")]);
        let dst = tempfile::tempdir().unwrap();
        let err = unpack(&bytes, dst.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsafeEntry { ref reason, .. }
            if reason == "symlink entry"));
    }

    #[test]
    fn hardlink_entries_are_rejected() {
        let bytes = raw_archive(&[("workspace/link", b'1', b"")]);
        let dst = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack(&bytes, dst.path()),
            Err(SnapshotError::UnsafeEntry { .. })
        ));
    }

    #[test]
    fn entries_outside_allowlist_fail_restore() {
        let bytes = raw_archive(&[("home_dotfiles/.bashrc", b'0', b"alias")]);
        let dst = tempfile::tempdir().unwrap();
        let err = unpack(&bytes, dst.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsafeEntry { ref reason, .. }
            if reason.contains("allowlist")));
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let dst = tempfile::tempdir().unwrap();
        let err = unpack(b"not a tarball at all", dst.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed(_)));
    }

    #[test]
    fn empty_home_packs_to_an_empty_archive() {
        let src = tempfile::tempdir().unwrap();
        let bytes = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        assert_eq!(unpack(&bytes, dst.path()).unwrap(), 0);
    }
}

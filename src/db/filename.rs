use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileType {
    Log(u64),
    Table(u64),
    /// A table still being written, removed on the next open.
    TempTable(u64),
    Manifest(u64),
    Current,
    Lock,
    Temp(u64),
}

static NUMBERED_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(log|ldb|ldb\.tmp|dbtmp)$").expect("valid regex")
});
static MANIFEST_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^MANIFEST-(\d+)$").expect("valid regex"));

pub(crate) fn log_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.log"))
}

pub(crate) fn table_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.ldb"))
}

pub(crate) fn temp_table_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.ldb.tmp"))
}

pub(crate) fn manifest_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("MANIFEST-{number:06}"))
}

pub(crate) fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

pub(crate) fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

pub(crate) fn temp_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.dbtmp"))
}

pub(crate) fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::Lock),
        _ => {}
    }

    if let Some(caps) = MANIFEST_FILE.captures(name) {
        return caps[1].parse().ok().map(FileType::Manifest);
    }

    let caps = NUMBERED_FILE.captures(name)?;
    let number = caps[1].parse().ok()?;
    match &caps[2] {
        "log" => Some(FileType::Log(number)),
        "ldb" => Some(FileType::Table(number)),
        "ldb.tmp" => Some(FileType::TempTable(number)),
        "dbtmp" => Some(FileType::Temp(number)),
        _ => None,
    }
}

/// Points `CURRENT` at the manifest with the given number.
pub(crate) fn set_current_file(db: &Path, manifest_number: u64) -> Result<()> {
    let manifest = manifest_file_name(db, manifest_number);
    let contents = format!(
        "{}\n",
        manifest
            .file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    );

    let tmp = temp_file_name(db, manifest_number);
    let guard = scopeguard::guard(tmp.clone(), |tmp| {
        let _ = std::fs::remove_file(tmp);
    });

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, current_file_name(db))?;
    scopeguard::ScopeGuard::into_inner(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{
        log_file_name, manifest_file_name, parse_file_name, set_current_file, table_file_name,
        FileType,
    };

    #[test]
    fn parse() {
        let cases = [
            ("100.log", Some(FileType::Log(100))),
            ("000123.ldb", Some(FileType::Table(123))),
            ("000007.ldb.tmp", Some(FileType::TempTable(7))),
            ("MANIFEST-000002", Some(FileType::Manifest(2))),
            ("000002.dbtmp", Some(FileType::Temp(2))),
            ("CURRENT", Some(FileType::Current)),
            ("LOCK", Some(FileType::Lock)),
            ("", None),
            ("foo", None),
            ("100", None),
            ("100.", None),
            ("MANIFEST", None),
            ("MANIFEST-", None),
            ("MANIFEST-3x", None),
            ("184467440737095516150.log", None),
            ("100.sst", None),
            ("x100.log", None),
        ];
        for (name, expected) in cases {
            assert_eq!(parse_file_name(name), expected, "name: {name}");
        }
    }

    #[test]
    fn construct() {
        let db = Path::new("foo");
        assert_eq!(log_file_name(db, 192), Path::new("foo/000192.log"));
        assert_eq!(table_file_name(db, 1234567), Path::new("foo/1234567.ldb"));
        assert_eq!(manifest_file_name(db, 3), Path::new("foo/MANIFEST-000003"));
    }

    #[test]
    fn current_points_to_manifest() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        set_current_file(dir.path(), 5)?;
        let current = std::fs::read_to_string(dir.path().join("CURRENT"))?;
        assert_eq!(current, "MANIFEST-000005\n");
        assert!(!dir.path().join("000005.dbtmp").exists());
        Ok(())
    }
}

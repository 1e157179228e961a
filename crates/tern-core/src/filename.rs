//! On-disk file naming.
//!
//! ```text
//! 0000000007_db.log     write-ahead log number 7
//! manifest.0000000003   manifest generation 3
//! sst.0000000012        table file 12
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Log(u64),
    Manifest(u64),
    Table(u64),
}

pub fn log_file_name(number: u64) -> String {
    format!("{:010}_db.log", number)
}

pub fn manifest_file_name(number: u64) -> String {
    format!("manifest.{:010}", number)
}

pub fn table_file_name(number: u64) -> String {
    format!("sst.{:010}", number)
}

/// Classifies a directory entry; unrelated names yield `None`.
pub fn parse_file_name(name: &str) -> Option<FileKind> {
    if let Some(num) = name.strip_suffix("_db.log") {
        return parse_number(num).map(FileKind::Log);
    }
    if let Some(num) = name.strip_prefix("manifest.") {
        return parse_number(num).map(FileKind::Manifest);
    }
    if let Some(num) = name.strip_prefix("sst.") {
        return parse_number(num).map(FileKind::Table);
    }
    None
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_zero_padded() {
        assert_eq!(log_file_name(7), "0000000007_db.log");
        assert_eq!(manifest_file_name(3), "manifest.0000000003");
        assert_eq!(table_file_name(12), "sst.0000000012");
    }

    #[test]
    fn test_parse_roundtrip() {
        assert_eq!(parse_file_name(&log_file_name(42)), Some(FileKind::Log(42)));
        assert_eq!(
            parse_file_name(&manifest_file_name(9)),
            Some(FileKind::Manifest(9))
        );
        assert_eq!(parse_file_name(&table_file_name(1)), Some(FileKind::Table(1)));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_file_name("LOCK"), None);
        assert_eq!(parse_file_name("manifest."), None);
        assert_eq!(parse_file_name("sst.12a"), None);
        assert_eq!(parse_file_name("manifest.0000000003.tmp"), None);
    }
}

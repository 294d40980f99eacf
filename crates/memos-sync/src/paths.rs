//! Vault path derivation: month directories, note names, resource links.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, TimeZone};
use memos_core::Resource;

/// Subdirectory of each month directory holding localized attachments.
pub const RESOURCE_DIR: &str = "resources";

const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '#'];

fn is_forbidden(c: char) -> bool {
    FORBIDDEN.contains(&c) || c.is_control()
}

/// Make `name` safe as a single file-name component.
///
/// Leading markers and whitespace are stripped, forbidden characters removed,
/// whitespace runs collapsed. Falls back to `untitled` when nothing is left.
pub fn sanitize_file_name(name: &str) -> String {
    let stripped = name.trim_start_matches(|c: char| is_forbidden(c) || c.is_whitespace());
    let cleaned: String = stripped.chars().filter(|c| !is_forbidden(*c)).collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "untitled".to_string()
    } else {
        collapsed
    }
}

pub fn note_file_name(title: &str) -> String {
    format!("{}.md", sanitize_file_name(title))
}

/// `{root}/{YYYY}/{MM}` for the local date of `created`.
pub fn month_dir<Tz: TimeZone>(sync_root: &Path, created: &DateTime<Tz>) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    sync_root
        .join(created.format("%Y").to_string())
        .join(created.format("%m").to_string())
}

pub fn resource_file_name(resource: &Resource) -> String {
    format!(
        "{}_{}",
        resource.resource_id(),
        sanitize_file_name(&resource.filename)
    )
}

fn segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Link from the note at `from_file` to `to_file`, both vault-relative,
/// always joined with `/`.
pub fn relative_link(from_file: &Path, to_file: &Path) -> String {
    let from_dir = from_file.parent().map(segments).unwrap_or_default();
    let to = segments(to_file);

    let common = from_dir
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    parts.extend(std::iter::repeat("..").take(from_dir.len() - common));
    parts.extend(to[common..].iter().map(String::as_str));
    parts.join("/")
}

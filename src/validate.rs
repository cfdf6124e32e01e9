//! Input validation for resource definitions.
//!
//! Every value that later becomes a path segment or an argument to `git`
//! passes through here first. The checks are pure and return the reason a
//! value was rejected.

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use url::{Host, Url};

use crate::error::ValidationError;
use crate::models::ResourceDefinition;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_BRANCH_LEN: usize = 128;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_SEARCH_PATH_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2000;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").unwrap());
static BRANCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9/_.-]+$").unwrap());
static DRIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]:").unwrap());

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidationError::new(
            "name",
            format!(
                "'{}' must start with a letter and contain only letters, digits, and '-'",
                name
            ),
        ));
    }
    Ok(())
}

pub fn validate_branch(branch: &str) -> Result<(), ValidationError> {
    if branch.is_empty() {
        return Err(ValidationError::new("branch", "must not be empty"));
    }
    if branch.len() > MAX_BRANCH_LEN {
        return Err(ValidationError::new(
            "branch",
            format!("must be at most {} characters", MAX_BRANCH_LEN),
        ));
    }
    if branch.starts_with('-') {
        return Err(ValidationError::new("branch", "must not start with '-'"));
    }
    if !BRANCH_RE.is_match(branch) {
        return Err(ValidationError::new(
            "branch",
            format!("'{}' contains characters outside [A-Za-z0-9/_.-]", branch),
        ));
    }
    Ok(())
}

/// Validates a git remote URL and returns its normalized form.
///
/// GitHub URLs are reduced to `https://github.com/<owner>/<repo>`, dropping
/// a `.git` suffix and any `/blob/...` or `/tree/...` tail. Other hosts are
/// returned as written.
pub fn validate_git_url(raw: &str) -> Result<String, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::new("url", "must not be empty"));
    }
    if raw.len() > MAX_URL_LEN {
        return Err(ValidationError::new(
            "url",
            format!("must be at most {} characters", MAX_URL_LEN),
        ));
    }

    let url = Url::parse(raw).map_err(|e| ValidationError::new("url", e.to_string()))?;

    if url.scheme() != "https" {
        return Err(ValidationError::new(
            "url",
            format!("scheme must be https, got '{}'", url.scheme()),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ValidationError::new(
            "url",
            "must not contain embedded credentials",
        ));
    }

    let host = url
        .host()
        .ok_or_else(|| ValidationError::new("url", "must include a host"))?;
    match host {
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(ValidationError::new("url", "host must not be localhost"));
            }
        }
        Host::Ipv4(ip) => check_ip(IpAddr::V4(ip))?,
        Host::Ipv6(ip) => check_ip(IpAddr::V6(ip))?,
    }

    Ok(normalize_github(&url).unwrap_or_else(|| raw.to_string()))
}

fn check_ip(ip: IpAddr) -> Result<(), ValidationError> {
    if is_internal(ip) {
        return Err(ValidationError::new(
            "url",
            format!("host {} is a loopback, private, or link-local address", ip),
        ));
    }
    Ok(())
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_v4(mapped);
            }
            is_internal_v6(v6)
        }
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // carrier-grade NAT, 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

fn normalize_github(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    if host != "github.com" && host != "www.github.com" {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }
    Some(format!("https://github.com/{}/{}", owner, repo))
}

pub fn validate_search_path(path: &str) -> Result<(), ValidationError> {
    if path.trim().is_empty() {
        return Err(ValidationError::new("search_path", "must not be empty"));
    }
    if path.len() > MAX_SEARCH_PATH_LEN {
        return Err(ValidationError::new(
            "search_path",
            format!("must be at most {} characters", MAX_SEARCH_PATH_LEN),
        ));
    }
    if path.contains('\n') || path.contains('\r') {
        return Err(ValidationError::new(
            "search_path",
            "must not contain line breaks",
        ));
    }
    if path.contains("..") {
        return Err(ValidationError::new("search_path", "must not contain '..'"));
    }
    if path.starts_with('/') || path.starts_with('\\') || DRIVE_RE.is_match(path) {
        return Err(ValidationError::new(
            "search_path",
            "must be relative to the repository root",
        ));
    }
    Ok(())
}

pub fn validate_notes(notes: &str) -> Result<(), ValidationError> {
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(ValidationError::new(
            "notes",
            format!("must be at most {} characters", MAX_NOTES_LEN),
        ));
    }
    if notes
        .chars()
        .any(|c| c.is_control() && c != '\t' && c != '\n')
    {
        return Err(ValidationError::new(
            "notes",
            "must not contain control characters",
        ));
    }
    Ok(())
}

pub fn validate_local_path(path: &Path) -> Result<(), ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::new(
            "path",
            format!("'{}' must be absolute", path.display()),
        ));
    }
    Ok(())
}

/// Validates every field of a definition and returns it with its URL normalized.
pub fn validate_definition(def: &ResourceDefinition) -> Result<ResourceDefinition, ValidationError> {
    validate_name(def.name())?;
    validate_notes(def.notes())?;

    match def {
        ResourceDefinition::Git {
            name,
            url,
            branch,
            search_paths,
            notes,
        } => {
            let url = validate_git_url(url)?;
            validate_branch(branch)?;
            for path in search_paths {
                validate_search_path(path)?;
            }
            Ok(ResourceDefinition::Git {
                name: name.clone(),
                url,
                branch: branch.clone(),
                search_paths: search_paths.clone(),
                notes: notes.clone(),
            })
        }
        ResourceDefinition::Local { path, .. } => {
            validate_local_path(path)?;
            Ok(def.clone())
        }
    }
}

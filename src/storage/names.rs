const MAX_EXTENSION_LENGTH: usize = 4;

/// Maps a resource url to the name of its cache file.
pub trait FileNameGenerator: Send + Sync {
    fn generate(&self, url: &str) -> String;
}

/// Names files by the md5 of the url, keeping a short extension when present.
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5FileNameGenerator;

impl FileNameGenerator for Md5FileNameGenerator {
    fn generate(&self, url: &str) -> String {
        let name = format!("{:x}", md5::compute(url.as_bytes()));
        match extension(url) {
            Some(ext) => format!("{name}.{ext}"),
            None => name,
        }
    }
}

fn extension(url: &str) -> Option<&str> {
    let dot = url.rfind('.')?;
    let after_slash = url.rfind('/').map(|slash| dot > slash).unwrap_or(true);
    if after_slash && dot + 2 + MAX_EXTENSION_LENGTH > url.len() {
        let ext = &url[dot + 1..];
        if !ext.is_empty() {
            return Some(ext);
        }
    }
    None
}

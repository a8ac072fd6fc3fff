use std::collections::HashMap;

/// Extra headers sent with every request to the origin of `url`.
pub trait HeaderInjector: Send + Sync {
    fn add_headers(&self, url: &str) -> Vec<(String, String)>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHeadersInjector;

impl HeaderInjector for EmptyHeadersInjector {
    fn add_headers(&self, _url: &str) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Same set of headers for every url.
#[derive(Debug, Default, Clone)]
pub struct StaticHeadersInjector {
    headers: Vec<(String, String)>,
}

impl StaticHeadersInjector {
    pub fn new(headers: &HashMap<String, String>) -> Self {
        let mut headers: Vec<_> = headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        headers.sort();
        Self { headers }
    }
}

impl HeaderInjector for StaticHeadersInjector {
    fn add_headers(&self, _url: &str) -> Vec<(String, String)> {
        self.headers.clone()
    }
}

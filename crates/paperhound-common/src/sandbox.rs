use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use crate::error::PaperhoundError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("paperhound/", env!("CARGO_PKG_VERSION"), " (literature review)");

/// An HTTP client that only issues requests to approved hosts.
///
/// Every paperhound component receives one of these instead of a bare
/// `reqwest::Client`, so the set of hosts the pipeline can reach is explicit
/// and tests can point components at a local mock server.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a client with the default allowlist and a 30 second timeout.
    pub fn new() -> Result<Self, PaperhoundError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a client with the default allowlist and the given request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, PaperhoundError> {
        let mut allowlist = HashSet::new();
        let domains = [
            "export.arxiv.org",        // arXiv API
            "arxiv.org",               // arXiv PDFs
            "api.biorxiv.org",         // bioRxiv / medRxiv API
            "biorxiv.org",             // bioRxiv PDFs
            "medrxiv.org",             // medRxiv PDFs
            "eutils.ncbi.nlm.nih.gov", // PubMed
            "ncbi.nlm.nih.gov",        // PMC PDFs
            "pubmed.ncbi.nlm.nih.gov", // PubMed landing pages
            "api.unpaywall.org",       // Unpaywall
            "doi.org",                 // DOI resolver
            "localhost",               // local model server
            "127.0.0.1",               // localhost alt
        ];
        for d in domains {
            allowlist.insert(d.to_string());
        }

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PaperhoundError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, allowlist })
    }

    /// Appends a hostname to the allowlist. Subdomains are allowed implicitly.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Builder-style variant of [`allow_domain`](Self::allow_domain).
    pub fn allowing<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for d in domains {
            self.allow_domain(d.as_ref());
        }
        self
    }

    /// Allows the hosts of URLs handed out by a trusted directory
    /// (Unpaywall locations, DOI redirects). Unparseable URLs are skipped.
    pub fn allowing_hosts_of<'a, I>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        for url in urls {
            if let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
                self.allow_domain(&host);
            }
        }
        self
    }

    /// Validates if a URL is permitted under the current policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        if let Ok(parsed) = Url::parse(url) {
            if let Some(host) = parsed.host_str() {
                for allowed in &self.allowlist {
                    if host == allowed || host.ends_with(&format!(".{}", allowed)) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, PaperhoundError> {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, PaperhoundError> {
        self.request(reqwest::Method::POST, url)
    }

    pub fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, PaperhoundError> {
        if !self.is_allowed(url) {
            return Err(PaperhoundError::Security(format!(
                "domain not in allowlist for URL {}",
                url
            )));
        }

        Ok(self.client.request(method, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlist_covers_catalogs() {
        let c = SandboxClient::new().unwrap();
        assert!(c.is_allowed("https://export.arxiv.org/api/query?search_query=all:x"));
        assert!(c.is_allowed("https://www.biorxiv.org/content/10.1101/2020.01.01.000001v1.full.pdf"));
        assert!(c.is_allowed("http://127.0.0.1:8080/paper.pdf"));
    }

    #[test]
    fn test_unknown_host_rejected() {
        let c = SandboxClient::new().unwrap();
        assert!(!c.is_allowed("https://example.com/paper.pdf"));
        assert!(!c.is_allowed("not a url"));
        assert!(matches!(c.get("https://example.com/"), Err(PaperhoundError::Security(_))));
    }

    #[test]
    fn test_suffix_match_requires_label_boundary() {
        let c = SandboxClient::new().unwrap();
        assert!(!c.is_allowed("https://evilarxiv.org/pdf/1.pdf"));
    }

    #[test]
    fn test_allowing_extends_list() {
        let c = SandboxClient::new().unwrap().allowing(["journals.plos.org"]);
        assert!(c.is_allowed("https://journals.plos.org/plosone/article/file?id=1"));
    }

    #[test]
    fn test_allowing_hosts_of_urls() {
        let c = SandboxClient::new()
            .unwrap()
            .allowing_hosts_of(["https://www.nature.com/articles/x.pdf", "garbage"]);
        assert!(c.is_allowed("https://www.nature.com/articles/y.pdf"));
        assert!(!c.is_allowed("https://nature.com/articles/y.pdf"));
    }
}

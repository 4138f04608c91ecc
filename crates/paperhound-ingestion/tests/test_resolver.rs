//! Open-access resolution against a scripted HTTP server.

use paperhound_common::config::ResolverConfig;
use paperhound_common::SandboxClient;
use paperhound_ingestion::models::{Access, PaperRecord, SourceKind};
use paperhound_ingestion::resolver::ResolverEndpoints;
use paperhound_ingestion::OpenAccessResolver;
use paperhound_test_utils::{MockResponse, MockServer};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PDF_BYTES: &[u8] = b"%PDF-1.5\n%stub\n";

fn resolver(server: &MockServer, email: Option<&str>) -> anyhow::Result<OpenAccessResolver> {
    resolver_with_timeout(server, email, 5)
}

fn resolver_with_timeout(server: &MockServer, email: Option<&str>, timeout_secs: u64) -> anyhow::Result<OpenAccessResolver> {
    let config = ResolverConfig {
        check_attempts: 3,
        check_timeout_secs: timeout_secs,
        initial_backoff_ms: 1,
        unpaywall_email: email.map(str::to_string),
        scrape_landing_pages: true,
    };
    let endpoints = ResolverEndpoints {
        arxiv_pdf: server.url("/pdf"),
        pmc: server.url("/pmc"),
        unpaywall: server.url("/unpaywall"),
        doi: server.url("/doi"),
    };
    Ok(OpenAccessResolver::new(&config, SandboxClient::new()?).with_endpoints(endpoints))
}

fn arxiv(id: &str) -> PaperRecord {
    PaperRecord::new(SourceKind::Arxiv, id, "Attention Patterns in Protein Language Models")
}

fn pubmed(pmid: &str, doi: Option<&str>) -> PaperRecord {
    let mut r = PaperRecord::new(SourceKind::PubMed, pmid, "Gut Microbiome and Sleep");
    r.doi = doi.map(str::to_string);
    r
}

#[tokio::test]
async fn test_arxiv_pdf_is_downloadable() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/pdf/2101.00001.pdf", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, None)?;

    let res = r.resolve(&arxiv("2101.00001"), &CancellationToken::new()).await;
    assert_eq!(res.paper, "arxiv:2101.00001");
    assert_eq!(
        res.access,
        Access::Downloadable {
            url: server.url("/pdf/2101.00001.pdf"),
            format: paperhound_ingestion::models::ArtifactFormat::Pdf,
            mirrors: vec![],
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_pdf_check_retries_server_errors() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.script("/pdf/2101.00002.pdf", vec![MockResponse::status(503), MockResponse::pdf(PDF_BYTES)]);
    let r = resolver(&server, None)?;

    let res = r.resolve(&arxiv("2101.00002"), &CancellationToken::new()).await;
    assert!(res.is_downloadable());
    assert_eq!(server.hits("/pdf/2101.00002.pdf"), 2);
    Ok(())
}

#[tokio::test]
async fn test_html_answer_is_not_a_pdf() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/pdf/2101.00003.pdf", MockResponse::html("<html>captcha</html>"));
    let r = resolver(&server, None)?;

    let res = r.resolve(&arxiv("2101.00003"), &CancellationToken::new()).await;
    assert!(!res.is_downloadable());
    assert_eq!(server.hits("/pdf/2101.00003.pdf"), 1);
    Ok(())
}

#[tokio::test]
async fn test_preprint_mirrors_kept_in_order() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/content/10.1101/2024.01.01.1.full.pdf", MockResponse::pdf(PDF_BYTES));
    server.respond("/content/10.1101/2024.01.01.1/full.pdf", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, None)?;

    let mut record = PaperRecord::new(SourceKind::BioRxiv, "10.1101/2024.01.01.1", "Cell Atlas");
    record.url = Some(server.url("/content/10.1101/2024.01.01.1?versioned=true"));
    let res = r.resolve(&record, &CancellationToken::new()).await;
    assert_eq!(
        res.candidate_urls(),
        vec![
            server.url("/content/10.1101/2024.01.01.1.full.pdf").as_str(),
            server.url("/content/10.1101/2024.01.01.1/full.pdf").as_str(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_landing_page_citation_link() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond(
        "/doi/10.1000/sleep.1",
        MockResponse::html(r#"<html><head><meta name="citation_pdf_url" content="/files/sleep.pdf"></head></html>"#),
    );
    server.respond("/files/sleep.pdf", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, None)?;

    let res = r.resolve(&pubmed("123", Some("10.1000/sleep.1")), &CancellationToken::new()).await;
    assert_eq!(res.candidate_urls(), vec![server.url("/files/sleep.pdf").as_str()]);
    Ok(())
}

#[tokio::test]
async fn test_pmc_candidate_from_pmcid() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/pmc/PMC42/pdf/", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, None)?;

    let mut record = pubmed("456", None);
    record.raw.insert("pmcid".into(), json!("PMC42"));
    let res = r.resolve(&record, &CancellationToken::new()).await;
    assert_eq!(res.candidate_urls(), vec![server.url("/pmc/PMC42/pdf/").as_str()]);
    Ok(())
}

#[tokio::test]
async fn test_unpaywall_location() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond(
        "/unpaywall/10.1000/oa.2",
        MockResponse::json(json!({
            "best_oa_location": { "url_for_pdf": server.url("/oa.pdf"), "host_type": "repository" },
            "oa_locations": []
        })),
    );
    server.respond("/oa.pdf", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, Some("me@example.org"))?;

    let res = r.resolve(&pubmed("789", Some("10.1000/oa.2")), &CancellationToken::new()).await;
    assert_eq!(res.candidate_urls(), vec![server.url("/oa.pdf").as_str()]);
    assert_eq!(server.hits("/unpaywall/10.1000/oa.2"), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_pdf_falls_back_to_doi_link() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    let r = resolver(&server, None)?;

    let mut record = arxiv("2101.00004");
    record.doi = Some("10.1000/closed.3".into());
    let res = r.resolve(&record, &CancellationToken::new()).await;
    assert_eq!(res.access, Access::LinkOnly { url: server.url("/doi/10.1000/closed.3") });
    Ok(())
}

#[tokio::test]
async fn test_nothing_to_offer_is_unavailable() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    let r = resolver(&server, None)?;

    let res = r.resolve(&pubmed("999", None), &CancellationToken::new()).await;
    assert!(matches!(res.access, Access::Unavailable { .. }));
    assert_eq!(server.total_hits(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_resolution() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/pdf/2101.00005.pdf", MockResponse::pdf(PDF_BYTES));
    let r = resolver(&server, None)?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = r.resolve(&arxiv("2101.00005"), &cancel).await;
    assert_eq!(res.access, Access::Unavailable { reason: "cancelled".into() });
    Ok(())
}

#[tokio::test]
async fn test_client_error_is_not_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond("/pdf/2101.00006.pdf", MockResponse::status(404));
    let r = resolver(&server, None)?;

    let res = r.resolve(&arxiv("2101.00006"), &CancellationToken::new()).await;
    assert!(!res.is_downloadable());
    assert_eq!(server.hits("/pdf/2101.00006.pdf"), 1);
    Ok(())
}

#[tokio::test]
async fn test_timeout_is_not_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond(
        "/pdf/2101.00007.pdf",
        MockResponse::pdf(PDF_BYTES).with_delay(Duration::from_millis(2500)),
    );
    let r = resolver_with_timeout(&server, None, 1)?;

    let res = r.resolve(&arxiv("2101.00007"), &CancellationToken::new()).await;
    assert!(!res.is_downloadable());
    assert_eq!(server.hits("/pdf/2101.00007.pdf"), 1);
    Ok(())
}

#[tokio::test]
async fn test_slow_unpaywall_is_bounded_by_timeout() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond(
        "/unpaywall/10.1000/slow.1",
        MockResponse::json(json!({ "best_oa_location": null, "oa_locations": [] }))
            .with_delay(Duration::from_secs(30)),
    );
    let r = resolver_with_timeout(&server, Some("me@example.org"), 1)?;

    let res = tokio::time::timeout(
        Duration::from_secs(10),
        r.resolve(&pubmed("790", Some("10.1000/slow.1")), &CancellationToken::new()),
    )
    .await?;
    assert_eq!(server.hits("/unpaywall/10.1000/slow.1"), 1);
    // The DOI page is still offered as a link.
    assert_eq!(res.access, Access::LinkOnly { url: server.url("/doi/10.1000/slow.1") });
    Ok(())
}

#[tokio::test]
async fn test_cancel_interrupts_unpaywall_lookup() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.respond(
        "/unpaywall/10.1000/slow.2",
        MockResponse::json(json!({ "best_oa_location": null, "oa_locations": [] }))
            .with_delay(Duration::from_secs(30)),
    );
    let r = resolver(&server, Some("me@example.org"))?;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let res = tokio::time::timeout(Duration::from_secs(2), r.resolve(&pubmed("791", Some("10.1000/slow.2")), &cancel)).await?;
    assert_eq!(res.access, Access::Unavailable { reason: "cancelled".into() });
    Ok(())
}

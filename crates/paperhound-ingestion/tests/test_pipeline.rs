//! End-to-end processing of a selection against a scripted HTTP server.

use std::sync::Arc;
use std::time::Duration;

use paperhound_common::config::{ResolverConfig, SummarizerConfig};
use paperhound_common::SandboxClient;
use paperhound_ingestion::cache::ArtifactCache;
use paperhound_ingestion::models::{PaperRecord, SectionKind, SourceKind};
use paperhound_ingestion::pipeline::{PipelineProgress, Stage};
use paperhound_ingestion::resolver::ResolverEndpoints;
use paperhound_ingestion::{
    process_selection, render_report, Downloader, OpenAccessResolver, PaperOutcome, PipelineDeps, RetryPolicy,
    Summarizer, TextExtractor,
};
use paperhound_test_utils::{paper_pdf, FakeSummarizer, MockResponse, MockServer, PdfBuilder};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn deps(server: &MockServer, cache_dir: &std::path::Path) -> anyhow::Result<PipelineDeps> {
    let client = SandboxClient::new()?;
    let resolver_config = ResolverConfig {
        check_attempts: 2,
        check_timeout_secs: 5,
        initial_backoff_ms: 1,
        unpaywall_email: None,
        scrape_landing_pages: true,
    };
    let endpoints = ResolverEndpoints {
        arxiv_pdf: server.url("/pdf"),
        pmc: server.url("/pmc"),
        unpaywall: server.url("/unpaywall"),
        doi: server.url("/doi"),
    };
    let summarizer_config = SummarizerConfig {
        max_input_tokens: 256,
        target_summary_tokens: 64,
        chunk_summary_tokens: 32,
        chunk_concurrency: 2,
        include_references: false,
    };
    Ok(PipelineDeps {
        resolver: OpenAccessResolver::new(&resolver_config, client.clone()).with_endpoints(endpoints),
        downloader: Downloader::new(
            client,
            Arc::new(ArtifactCache::open(cache_dir)?),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
        ),
        extractor: TextExtractor::new(),
        summarizer: Summarizer::new(Arc::new(FakeSummarizer::new(256)), summarizer_config),
        workers: 2,
        focus: None,
    })
}

fn selection() -> Vec<PaperRecord> {
    let mut good = PaperRecord::new(SourceKind::Arxiv, "2101.00001", "Folding Proteins with Attention");
    good.authors = vec!["Ada Lovelace".into()];
    let scanned = PaperRecord::new(SourceKind::Arxiv, "2101.00002", "A Scanned Manuscript");
    let mut closed = PaperRecord::new(SourceKind::PubMed, "3141592", "Closed Access Cohort Study");
    closed.doi = Some("10.1000/closed.1".into());
    vec![good, scanned, closed]
}

fn script(server: &MockServer) -> anyhow::Result<()> {
    let good = paper_pdf(
        "Folding Proteins with Attention",
        &[
            ("Abstract", "We fold proteins with attention layers."),
            ("Introduction", "Protein folding is hard. Attention helps."),
            ("References", "[1] Someone. A paper."),
        ],
    )?;
    server.respond("/pdf/2101.00001.pdf", MockResponse::pdf(good));
    server.respond("/pdf/2101.00002.pdf", MockResponse::pdf(PdfBuilder::new().blank_page().build()?));
    Ok(())
}

fn drain(rx: &mut broadcast::Receiver<PipelineProgress>) -> Vec<PipelineProgress> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_selection_outcomes() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    script(&server)?;
    let dir = tempfile::tempdir()?;
    let deps = deps(&server, dir.path())?;
    let (tx, mut rx) = broadcast::channel(64);

    let report = process_selection(selection(), &deps, &CancellationToken::new(), Some(tx)).await;

    let ids: Vec<&str> = report.papers.iter().map(|p| p.record.id.as_str()).collect();
    assert_eq!(ids, vec!["2101.00001", "2101.00002", "3141592"]);

    match &report.papers[0].outcome {
        PaperOutcome::Summarized { url, summary } => {
            assert_eq!(url, &server.url("/pdf/2101.00001.pdf"));
            assert!(summary.aggregate.contains("fold proteins"));
            assert!(!summary.aggregate.contains("Someone"));
        }
        other => panic!("expected summary, got {other:?}"),
    }
    assert!(matches!(report.papers[1].outcome, PaperOutcome::Failed { stage: Stage::Extract }));
    match &report.papers[2].outcome {
        PaperOutcome::LinkOnly { url } => assert_eq!(url, &server.url("/doi/10.1000/closed.1")),
        other => panic!("expected link, got {other:?}"),
    }

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].paper, "arxiv:2101.00002");
    assert_eq!(report.failures[0].kind, "no_text_layer");
    assert_eq!(report.count("summarized"), 1);
    assert_eq!(report.count("link_only"), 1);

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| e.run_id == report.run_id));
    assert!(events.iter().any(|e| e.paper == "arxiv:2101.00002" && e.error.is_some()));
    assert_eq!(events.last().map(|e| e.stage.as_str()), Some("complete"));

    let rendered = render_report(&report);
    assert!(rendered.starts_with("# Paper summaries"));
    assert!(rendered.contains("## 1. Folding Proteins with Attention"));
    assert!(rendered.contains("Failed during extract."));
    assert!(rendered.contains("No open-access PDF. Read it at"));
    assert!(rendered.contains("## Failures"));
    Ok(())
}

#[tokio::test]
async fn test_second_run_reuses_cache() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    script(&server)?;
    let dir = tempfile::tempdir()?;
    let deps = deps(&server, dir.path())?;
    let only_good: Vec<PaperRecord> = selection().into_iter().take(1).collect();

    process_selection(only_good.clone(), &deps, &CancellationToken::new(), None).await;
    let first = server.hits("/pdf/2101.00001.pdf");
    let report = process_selection(only_good, &deps, &CancellationToken::new(), None).await;

    assert_eq!(report.count("summarized"), 1);
    // Only the resolver's PDF check reaches the network the second time.
    assert_eq!(server.hits("/pdf/2101.00001.pdf"), first + 1);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_fails_every_paper() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    script(&server)?;
    let dir = tempfile::tempdir()?;
    let deps = deps(&server, dir.path())?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = process_selection(selection(), &deps, &cancel, None).await;
    assert_eq!(report.count("failed"), 3);
    assert!(report.failures.iter().all(|f| f.kind == "cancelled"));
    assert_eq!(server.total_hits(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_download_keeps_a_link() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    // The resolver sees a PDF; the download itself is refused.
    server.script(
        "/pdf/2101.00009.pdf",
        vec![MockResponse::pdf(b"%PDF-1.5\n%stub\n".to_vec()), MockResponse::status(403)],
    );
    let dir = tempfile::tempdir()?;
    let deps = deps(&server, dir.path())?;
    let mut record = PaperRecord::new(SourceKind::Arxiv, "2101.00009", "Blocked Preprint");
    record.doi = Some("10.1000/blocked.9".into());

    let report = process_selection(vec![record], &deps, &CancellationToken::new(), None).await;

    match &report.papers[0].outcome {
        PaperOutcome::LinkOnly { url } => assert_eq!(url, &server.url("/pdf/2101.00009.pdf")),
        other => panic!("expected link, got {other:?}"),
    }
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Download);
    assert_eq!(report.failures[0].kind, "permanent");
    // One look from the resolver, one refused download.
    assert_eq!(server.hits("/pdf/2101.00009.pdf"), 2);

    let rendered = render_report(&report);
    assert!(rendered.contains(&format!("Download failed. Read it at <{}>", server.url("/pdf/2101.00009.pdf"))));
    assert!(rendered.contains("- `arxiv:2101.00009` download (permanent)"));
    Ok(())
}

#[tokio::test]
async fn test_focused_run_summarizes_one_section() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    script(&server)?;
    let dir = tempfile::tempdir()?;
    let mut deps = deps(&server, dir.path())?;
    deps.focus = Some(SectionKind::Introduction);
    let only_good: Vec<PaperRecord> = selection().into_iter().take(1).collect();

    let report = process_selection(only_good, &deps, &CancellationToken::new(), None).await;
    match &report.papers[0].outcome {
        PaperOutcome::Summarized { summary, .. } => {
            assert!(summary.aggregate.contains("Protein folding is hard"));
            assert!(!summary.aggregate.contains("attention layers"));
        }
        other => panic!("expected summary, got {other:?}"),
    }
    assert!(render_report(&report).contains("Summary of the introduction section:"));

    deps.focus = Some(SectionKind::Methods);
    let only_good: Vec<PaperRecord> = selection().into_iter().take(1).collect();
    let report = process_selection(only_good, &deps, &CancellationToken::new(), None).await;
    assert!(matches!(report.papers[0].outcome, PaperOutcome::Failed { stage: Stage::Summarize }));
    assert_eq!(report.failures[0].kind, "section_missing");
    Ok(())
}

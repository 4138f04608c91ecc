//! Minimal text PDFs for extraction and download tests.
//!
//! Every line is its own BT/ET block in Helvetica (WinAnsi), so lopdf's
//! text extraction yields one line per call to [`PdfBuilder::line`].
//! Headings are set larger than body text.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

pub const BODY_SIZE: i64 = 10;
pub const HEADING_SIZE: i64 = 16;

const TOP: i64 = 800;
const LEADING: i64 = 14;
const LINES_PER_PAGE: usize = 52;

#[derive(Debug, Clone, Default)]
pub struct PdfBuilder {
    /// Lines per page with their font size; an empty page has no text.
    pages: Vec<Vec<(String, i64)>>,
}

impl PdfBuilder {
    pub fn new() -> Self {
        Self { pages: vec![Vec::new()] }
    }

    /// A body-text line on the current page.
    pub fn line(mut self, text: &str) -> Self {
        self.push(text, BODY_SIZE);
        self
    }

    /// Body text, one PDF line per `\n`-separated line.
    pub fn text(mut self, text: &str) -> Self {
        for line in text.lines() {
            self.push(line, BODY_SIZE);
        }
        self
    }

    pub fn heading(mut self, text: &str) -> Self {
        self.push(text, HEADING_SIZE);
        self
    }

    pub fn new_page(mut self) -> Self {
        self.pages.push(Vec::new());
        self
    }

    /// A page with no text layer at all (like a scanned image page).
    pub fn blank_page(self) -> Self {
        self.new_page()
    }

    fn push(&mut self, text: &str, size: i64) {
        if self.pages.last().is_some_and(|p| p.len() >= LINES_PER_PAGE) {
            self.pages.push(Vec::new());
        }
        if let Some(page) = self.pages.last_mut() {
            page.push((text.to_string(), size));
        }
    }

    pub fn build(&self) -> anyhow::Result<Vec<u8>> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for lines in &self.pages {
            let page_id = add_page(&mut doc, pages_id, resources_id, lines)?;
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)?;
        Ok(out)
    }
}

fn add_page(
    doc: &mut Document,
    pages_id: ObjectId,
    resources_id: ObjectId,
    lines: &[(String, i64)],
) -> anyhow::Result<ObjectId> {
    let mut operations = Vec::new();
    for (i, (text, size)) in lines.iter().enumerate() {
        let y = TOP - LEADING * i as i64;
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), (*size).into()]));
        operations.push(Operation::new("Td", vec![50.into(), y.into()]));
        operations.push(Operation::new("Tj", vec![Object::string_literal(text.as_str())]));
        operations.push(Operation::new("ET", vec![]));
    }
    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
    Ok(doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
    }))
}

/// A paper with a title line and one heading plus body per section.
pub fn paper_pdf(title: &str, sections: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
    let mut builder = PdfBuilder::new().line(title);
    for (heading, body) in sections {
        builder = builder.heading(heading).text(body);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_loadable_pdf() {
        let bytes = paper_pdf("A Title Line", &[("Introduction", "Some text.")]).unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
        let text = doc.extract_text(&[1]).unwrap();
        assert!(text.contains("Introduction"));
        assert!(text.contains("Some text."));
    }

    #[test]
    fn test_blank_page_has_no_text() {
        let bytes = PdfBuilder::new().build().unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert!(doc.extract_text(&[1]).unwrap_or_default().trim().is_empty());
    }

    #[test]
    fn test_long_text_spills_onto_new_pages() {
        let body = vec!["line"; 120].join("\n");
        let bytes = PdfBuilder::new().text(&body).build().unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }
}

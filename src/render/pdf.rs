//! lopdf page writer and inspection helpers.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};

use super::format;
use super::layout::{Font, Mark, Page, PAGE_HEIGHT, PAGE_WIDTH};
use crate::error::RenderError;

fn font_name(font: Font) -> &'static str {
    match font {
        Font::Regular => "F1",
        Font::Bold => "F2",
        Font::Symbol => "F3",
    }
}

fn int(value: i32) -> Object {
    Object::Integer(i64::from(value))
}

fn operations(page: &Page) -> Vec<Operation> {
    let mut ops = Vec::new();
    for mark in &page.marks {
        match mark {
            Mark::Text {
                x,
                y,
                size,
                font,
                text,
            } => {
                ops.push(Operation::new("BT", vec![]));
                ops.push(Operation::new(
                    "Tf",
                    vec![Object::Name(font_name(*font).as_bytes().to_vec()), int(*size)],
                ));
                ops.push(Operation::new("Td", vec![int(*x), int(*y)]));
                ops.push(Operation::new(
                    "Tj",
                    vec![Object::String(format::win_ansi(text), StringFormat::Literal)],
                ));
                ops.push(Operation::new("ET", vec![]));
            }
            Mark::Rule { x1, y1, x2, y2 } => {
                ops.push(Operation::new("w", vec![int(1)]));
                ops.push(Operation::new("m", vec![int(*x1), int(*y1)]));
                ops.push(Operation::new("l", vec![int(*x2), int(*y2)]));
                ops.push(Operation::new("S", vec![]));
            }
        }
    }
    ops
}

/// Serialize laid-out pages as a PDF on US Letter paper.
pub fn write_pages(pages: &[Page]) -> Result<Vec<u8>, RenderError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let symbol = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "ZapfDingbats",
    });
    let resources = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => regular,
            "F2" => bold,
            "F3" => symbol,
        },
    });

    let mut kids = Vec::with_capacity(pages.len());
    for page in pages {
        let content = Content {
            operations: operations(page),
        };
        let encoded = content
            .encode()
            .map_err(|e| RenderError::LayoutFailure(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources,
            "MediaBox" => vec![int(0), int(0), int(PAGE_WIDTH), int(PAGE_HEIGHT)],
        }),
    );
    let catalog = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog);

    save(&mut doc)
}

pub fn save(doc: &mut Document) -> Result<Vec<u8>, RenderError> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| RenderError::LayoutFailure(e.to_string()))?;
    Ok(bytes)
}

/// Number of pages in a PDF, or `None` when the bytes are not a readable PDF.
pub fn page_count(bytes: &[u8]) -> Option<i32> {
    Document::load_mem(bytes)
        .ok()
        .map(|doc| doc.get_pages().len() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> Page {
        Page {
            marks: vec![Mark::Text {
                x: 54,
                y: 700,
                size: 10,
                font: Font::Regular,
                text: text.to_string(),
            }],
        }
    }

    #[test]
    fn written_pages_can_be_read_back() {
        let bytes = write_pages(&[page("one"), page("two (2)")]).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));
        assert_eq!(page_count(&bytes), Some(2));
    }

    #[test]
    fn output_is_deterministic() {
        let a = write_pages(&[page("same")]).unwrap();
        let b = write_pages(&[page("same")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn accented_text_is_written_as_win_ansi_bytes() {
        let bytes = write_pages(&[page("Café Noël")]).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let content = Content::decode(&doc.get_page_content(page_id).unwrap()).unwrap();
        let shown: Vec<Vec<u8>> = content
            .operations
            .iter()
            .filter(|op| op.operator == "Tj")
            .filter_map(|op| op.operands.first()?.as_str().ok().map(<[u8]>::to_vec))
            .collect();
        assert_eq!(shown, vec![b"Caf\xe9 No\xebl".to_vec()]);
    }

    #[test]
    fn garbage_has_no_page_count() {
        assert_eq!(page_count(b"not a pdf"), None);
    }
}

//! Declarative page layouts for dynamic templates.
//!
//! A `LayoutSpec` is a list of sections. `compose` turns it into positioned
//! marks on US Letter pages, wrapping long values onto following lines (and
//! pages) instead of truncating them. All coordinates are whole points so the
//! same input always yields the same page content.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::format;
use crate::merge::{value_text, MergeBundle};
use crate::models::{Template, TemplateType};

pub const PAGE_WIDTH: i32 = 612;
pub const PAGE_HEIGHT: i32 = 792;
pub const MARGIN: i32 = 54;
const CONTENT_TOP: i32 = PAGE_HEIGHT - MARGIN;
const CONTENT_BOTTOM: i32 = 72;
const FOOTER_Y: i32 = 36;
const BODY_SIZE: i32 = 10;
const LEADING: i32 = 13;
const LABEL_WIDTH: i32 = 150;

pub const CLOSING_LINE: &str = "All other terms and conditions of this policy remain unchanged.";
pub const CONTINUATION_MARKER: &str = "Continued on next page";

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*(currency|date)\s*)?\}\}")
            .expect("placeholder pattern is valid");
}

/// Helvetica advance widths (1/1000 em) for ASCII 32..=126.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
    278, 278, 584, 584, 584, 556, 1015, // ':'..'@'
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // 'A'..'M'
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
    278, 278, 278, 469, 556, 333, // '['..'`'
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // 'a'..'m'
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // 'n'..'z'
    334, 260, 334, 584, // '{'..'~'
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Font {
    Regular,
    Bold,
    /// ZapfDingbats, used for check and cross marks.
    Symbol,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    Text {
        x: i32,
        y: i32,
        size: i32,
        font: Font,
        text: String,
    },
    Rule {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormat {
    #[default]
    Text,
    Currency,
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRow {
    pub label: String,
    pub path: String,
    #[serde(default)]
    pub format: ValueFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Section {
    /// Policy number, period, named insured, product and premium summary.
    Metadata,
    Coverages,
    EndorsementSchedule,
    Paragraph {
        #[serde(default)]
        heading: Option<String>,
        text: String,
    },
    Fields {
        #[serde(default)]
        heading: Option<String>,
        rows: Vec<FieldRow>,
    },
    /// Every entry of the `custom` map as a label/value table.
    Custom {
        #[serde(default)]
        heading: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSpec {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl LayoutSpec {
    /// The template's inline layout, or the built-in one for its type.
    pub fn for_template(template: &Template) -> Result<Self, String> {
        match &template.inline_layout {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())
                .map_err(|e| format!("template {} has an invalid layout: {e}", template.code)),
            _ => Ok(default_layout(template)),
        }
    }

    /// Layout for a component that has no template behind it.
    pub fn ad_hoc(name: &str) -> Self {
        Self {
            title: name.to_uppercase(),
            subtitle: Some("Policy {{policy.number}}".to_string()),
            sections: vec![
                Section::Metadata,
                Section::Custom { heading: None },
            ],
        }
    }
}

fn paragraph(text: &str) -> Section {
    Section::Paragraph {
        heading: None,
        text: text.to_string(),
    }
}

fn endorsement_header() -> Section {
    Section::Fields {
        heading: None,
        rows: vec![
            row("Policy Number", "policy.number", ValueFormat::Text),
            row("Named Insured", "insured.company_name", ValueFormat::Text),
            row("Endorsement Number", "endorsement.number", ValueFormat::Text),
            row(
                "Endorsement Effective",
                "endorsement.effective_date",
                ValueFormat::Date,
            ),
        ],
    }
}

fn row(label: &str, path: &str, format: ValueFormat) -> FieldRow {
    FieldRow {
        label: label.to_string(),
        path: path.to_string(),
        format,
    }
}

/// Endorsement body keyed by template code.
fn endorsement_sections(code: &str) -> Vec<Section> {
    let code = code.to_ascii_uppercase();
    let mut sections = vec![
        endorsement_header(),
        paragraph("This endorsement modifies insurance provided under the following policy."),
    ];

    if code.contains("ADD-INSURED") || code.contains("BLANKET-ADD") {
        sections.push(Section::Fields {
            heading: Some("Additional Insured".to_string()),
            rows: vec![
                row("Name", "custom.additional_insured_name", ValueFormat::Text),
                row("Address", "custom.additional_insured_address", ValueFormat::Text),
            ],
        });
        sections.push(paragraph(
            "The person or organization shown above is included as an additional insured, \
             but only with respect to liability arising out of operations performed by or on \
             behalf of {{insured.company_name}}.",
        ));
    } else if code.contains("WAIVER") {
        sections.push(Section::Fields {
            heading: Some("Waiver of Subrogation".to_string()),
            rows: vec![row("Waived Party", "custom.waiver_party", ValueFormat::Text)],
        });
        sections.push(paragraph(
            "We waive any right of recovery we may have against the party shown above. \
             This waiver applies only to the extent permitted by law.",
        ));
    } else if code.contains("PRIMARY") {
        sections.push(Section::Fields {
            heading: Some("Primary and Non-Contributory".to_string()),
            rows: vec![row(
                "Designated Party",
                "custom.additional_insured_name",
                ValueFormat::Text,
            )],
        });
        sections.push(paragraph(
            "This insurance is primary to and will not seek contribution from any other \
             insurance available to the party shown above.",
        ));
    } else {
        sections.push(paragraph("{{custom.description}}"));
        sections.push(Section::Custom {
            heading: Some("Endorsement Details".to_string()),
        });
    }

    sections.push(paragraph(CLOSING_LINE));
    sections
}

pub fn default_layout(template: &Template) -> LayoutSpec {
    let name = template.name.clone();
    let (title, subtitle, sections) = match template.template_type {
        TemplateType::Declaration => (
            "DECLARATIONS".to_string(),
            Some(name),
            vec![
                Section::Metadata,
                Section::Coverages,
                Section::EndorsementSchedule,
            ],
        ),
        TemplateType::PolicyForm => (
            name.to_uppercase(),
            Some(format!("Form {} (version {})", template.code, template.version)),
            vec![
                Section::Metadata,
                paragraph(
                    "This form forms part of policy {{policy.number}} issued to \
                     {{insured.company_name}} for the period {{policy.effective_date|date}} to \
                     {{policy.expiration_date|date}}.",
                ),
            ],
        ),
        TemplateType::StateForm | TemplateType::Notice => (
            name.to_uppercase(),
            Some("{{policy.state_code}} policyholder notice".to_string()),
            vec![
                paragraph(
                    "IMPORTANT NOTICE to {{insured.company_name}} regarding policy \
                     {{policy.number}}, effective {{policy.effective_date|date}}.",
                ),
                Section::Metadata,
            ],
        ),
        TemplateType::Schedule => (
            name.to_uppercase(),
            Some("Policy {{policy.number}}".to_string()),
            vec![Section::Coverages, Section::EndorsementSchedule],
        ),
        TemplateType::Certificate => (
            "CERTIFICATE OF INSURANCE".to_string(),
            Some(name),
            vec![
                Section::Metadata,
                Section::Coverages,
                paragraph(
                    "This certificate is issued as a matter of information only and confers no \
                     rights upon the certificate holder.",
                ),
            ],
        ),
        TemplateType::Endorsement => (
            name.to_uppercase(),
            Some("Endorsement to policy {{policy.number}}".to_string()),
            endorsement_sections(&template.code),
        ),
    };
    LayoutSpec {
        title,
        subtitle,
        sections,
    }
}

/// Replace `{{path}}`, `{{path|currency}}` and `{{path|date}}` placeholders.
pub fn fill(text: &str, bundle: &MergeBundle) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures| {
            let raw = bundle.text(&caps[1]);
            match caps.get(2).map(|m| m.as_str()) {
                Some("currency") => format::currency(&raw),
                Some("date") => format::date(&raw),
                _ => raw,
            }
        })
        .into_owned()
}

fn formatted(bundle: &MergeBundle, path: &str, value_format: ValueFormat) -> String {
    let raw = bundle.text(path);
    match value_format {
        ValueFormat::Text => raw,
        ValueFormat::Currency => format::currency(&raw),
        ValueFormat::Date => format::date(&raw),
    }
}

fn char_units(c: char) -> u64 {
    match c {
        ' '..='~' => u64::from(HELVETICA_WIDTHS[c as usize - 32]),
        _ => 556,
    }
}

/// Running measurement of a line, in font units.
#[derive(Debug, Clone, Copy, Default)]
struct Run {
    units: u64,
    chars: u64,
}

impl Run {
    fn of(text: &str) -> Self {
        text.chars().fold(Self::default(), Self::with)
    }

    fn with(self, c: char) -> Self {
        Self {
            units: self.units + char_units(c),
            chars: self.chars + 1,
        }
    }

    fn then(self, other: Self) -> Self {
        Self {
            units: self.units + other.units,
            chars: self.chars + other.chars,
        }
    }

    fn points(self, size: i32, font: Font) -> u64 {
        let units = match font {
            Font::Bold => self.units + self.units / 10,
            Font::Regular => self.units,
            Font::Symbol => self.chars * 900,
        };
        let scaled = units.saturating_mul(u64::from(size.max(0).unsigned_abs()));
        (scaled as f64 / 1000.0).ceil() as u64
    }

    fn fits(self, max_width: i32, size: i32, font: Font) -> bool {
        self.points(size, font) <= u64::from(max_width.max(0).unsigned_abs())
    }
}

/// Width of `text` in points, saturating at `i32::MAX`.
pub fn text_width(text: &str, size: i32, font: Font) -> i32 {
    i32::try_from(Run::of(text).points(size, font)).unwrap_or(i32::MAX)
}

/// Greedy word wrap. Words wider than the line are split; nothing is dropped.
pub fn wrap(text: &str, max_width: i32, size: i32, font: Font) -> Vec<String> {
    let space = Run::of(" ");
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        let mut run = Run::default();
        for word in paragraph.split_whitespace() {
            let word_run = Run::of(word);
            let candidate = if current.is_empty() {
                word_run
            } else {
                run.then(space).then(word_run)
            };
            if candidate.fits(max_width, size, font) {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(word);
                run = candidate;
                continue;
            }
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                run = Run::default();
            }
            if word_run.fits(max_width, size, font) {
                current.push_str(word);
                run = word_run;
                continue;
            }
            for c in word.chars() {
                let next = run.with(c);
                if !current.is_empty() && !next.fits(max_width, size, font) {
                    lines.push(std::mem::take(&mut current));
                    run = Run::default().with(c);
                } else {
                    run = next;
                }
                current.push(c);
            }
        }
        lines.push(current);
    }
    lines
}

struct Column {
    x: i32,
    width: i32,
}

/// Running page cursor.
pub struct Composer {
    pages: Vec<Page>,
    y: i32,
    running_header: String,
}

impl Composer {
    pub fn new(running_header: impl Into<String>) -> Self {
        Self {
            pages: vec![Page::default()],
            y: CONTENT_TOP,
            running_header: format::printable(&running_header.into()),
        }
    }

    fn page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn new_page(&mut self) {
        self.pages.push(Page::default());
        self.y = CONTENT_TOP;
        let header = format!("{} (continued)", self.running_header);
        self.put(MARGIN, 8, Font::Regular, &header);
        self.y -= LEADING + 4;
    }

    fn ensure_space(&mut self, height: i32) {
        if self.y - height < CONTENT_BOTTOM {
            self.new_page();
        }
    }

    fn put(&mut self, x: i32, size: i32, font: Font, text: &str) {
        let y = self.y;
        self.page().marks.push(Mark::Text {
            x,
            y,
            size,
            font,
            text: format::printable(text),
        });
    }

    pub fn gap(&mut self, height: i32) {
        self.y -= height;
        if self.y < CONTENT_BOTTOM {
            self.new_page();
        }
    }

    pub fn rule(&mut self) {
        self.ensure_space(6);
        let y = self.y + LEADING - 4;
        self.page().marks.push(Mark::Rule {
            x1: MARGIN,
            y1: y,
            x2: PAGE_WIDTH - MARGIN,
            y2: y,
        });
        self.y -= 6;
    }

    pub fn heading(&mut self, text: &str, size: i32) {
        let width = PAGE_WIDTH - 2 * MARGIN;
        for line in wrap(text, width, size, Font::Bold) {
            self.ensure_space(size + 4);
            self.put(MARGIN, size, Font::Bold, &line);
            self.y -= size + 4;
        }
    }

    pub fn paragraph(&mut self, text: &str) {
        self.text_at(MARGIN, PAGE_WIDTH - 2 * MARGIN, BODY_SIZE, Font::Regular, text);
        self.y -= 4;
    }

    pub fn text_at(&mut self, x: i32, width: i32, size: i32, font: Font, text: &str) {
        for line in wrap(text, width, size, font) {
            self.ensure_space(LEADING);
            self.put(x, size, font, &line);
            self.y -= LEADING;
        }
    }

    /// Line with a symbol glyph followed by regular text.
    pub fn marked_line(&mut self, symbol: &str, text: &str) {
        self.ensure_space(LEADING);
        let y = self.y;
        self.page().marks.push(Mark::Text {
            x: MARGIN,
            y,
            size: BODY_SIZE,
            font: Font::Symbol,
            text: symbol.to_string(),
        });
        let width = PAGE_WIDTH - 2 * MARGIN - 18;
        let mut first = true;
        for line in wrap(text, width, BODY_SIZE, Font::Regular) {
            if !first {
                self.ensure_space(LEADING);
            }
            first = false;
            self.put(MARGIN + 18, BODY_SIZE, Font::Regular, &line);
            self.y -= LEADING;
        }
    }

    fn table_row(&mut self, columns: &[Column], cells: &[String], font: Font) {
        let wrapped: Vec<Vec<String>> = columns
            .iter()
            .zip(cells)
            .map(|(col, cell)| wrap(cell, col.width - 6, BODY_SIZE, font))
            .collect();
        let height = wrapped.iter().map(Vec::len).max().unwrap_or(1).max(1);
        for line in 0..height {
            self.ensure_space(LEADING);
            for (col, lines) in columns.iter().zip(&wrapped) {
                if let Some(text) = lines.get(line) {
                    if !text.is_empty() {
                        self.put(col.x, BODY_SIZE, font, text);
                    }
                }
            }
            self.y -= LEADING;
        }
    }

    pub fn label_value(&mut self, label: &str, value: &str) {
        let columns = [
            Column {
                x: MARGIN,
                width: LABEL_WIDTH,
            },
            Column {
                x: MARGIN + LABEL_WIDTH,
                width: PAGE_WIDTH - 2 * MARGIN - LABEL_WIDTH,
            },
        ];
        self.table_row(&columns, &[label.to_string(), value.to_string()], Font::Regular);
    }

    fn grid(&mut self, widths: &[i32], header: &[&str], rows: &[Vec<String>]) {
        let mut x = MARGIN;
        let columns: Vec<Column> = widths
            .iter()
            .map(|w| {
                let col = Column { x, width: *w };
                x += w;
                col
            })
            .collect();
        let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
        self.table_row(&columns, &header, Font::Bold);
        self.rule();
        for row in rows {
            self.table_row(&columns, row, Font::Regular);
        }
    }

    pub fn finish(mut self, footer_left: &str) -> Vec<Page> {
        let total = self.pages.len();
        let footer_left = format::printable(footer_left);
        for (index, page) in self.pages.iter_mut().enumerate() {
            let label = format!("Page {} of {}", index + 1, total);
            let label_x = PAGE_WIDTH - MARGIN - text_width(&label, 8, Font::Regular);
            page.marks.push(Mark::Text {
                x: MARGIN,
                y: FOOTER_Y,
                size: 8,
                font: Font::Regular,
                text: footer_left.clone(),
            });
            page.marks.push(Mark::Text {
                x: label_x,
                y: FOOTER_Y,
                size: 8,
                font: Font::Regular,
                text: label,
            });
            if index + 1 < total {
                let x = (PAGE_WIDTH - text_width(CONTINUATION_MARKER, 8, Font::Regular)) / 2;
                page.marks.push(Mark::Text {
                    x,
                    y: FOOTER_Y + 12,
                    size: 8,
                    font: Font::Regular,
                    text: CONTINUATION_MARKER.to_string(),
                });
            }
        }
        self.pages
    }
}

fn metadata(composer: &mut Composer, bundle: &MergeBundle) {
    let period = format!(
        "{} to {}",
        format::date(&bundle.text("policy.effective_date")),
        format::date(&bundle.text("policy.expiration_date"))
    );
    let mut insured = bundle.text("insured.company_name");
    let dba = bundle.text("insured.dba_name");
    if !dba.is_empty() {
        insured = format!("{insured} DBA {dba}");
    }
    let product = match (bundle.text("product.name"), bundle.text("product.code")) {
        (name, code) if name.is_empty() => code,
        (name, code) => format!("{name} ({code})"),
    };

    composer.label_value("Policy Number", &bundle.text("policy.number"));
    composer.label_value("Policy Period", &period);
    composer.label_value("Named Insured", &insured);
    composer.label_value("Mailing Address", &bundle.text("insured.address"));
    composer.label_value("Product", &product);
    composer.label_value("State", &bundle.text("policy.state_code"));
    composer.label_value(
        "Annual Premium",
        &format::currency(&bundle.text("policy.annual_premium")),
    );
    composer.label_value("Quote Number", &bundle.text("quote.number"));
}

fn coverages(composer: &mut Composer, bundle: &MergeBundle) {
    composer.heading("Coverage Schedule", 12);
    let rows: Vec<Vec<String>> = bundle
        .lookup("coverages")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|c| {
                    let field = |key: &str| c.get(key).map(value_text).unwrap_or_default();
                    vec![
                        field("name"),
                        format::currency(&field("limit")),
                        format::currency(&field("deductible")),
                        format::currency(&field("premium")),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();

    if rows.is_empty() {
        composer.paragraph("No coverages scheduled.");
        return;
    }
    composer.grid(
        &[216, 100, 88, 100],
        &["Coverage", "Limit", "Deductible", "Premium"],
        &rows,
    );
}

fn endorsement_schedule(composer: &mut Composer, bundle: &MergeBundle) {
    composer.heading("Endorsement Schedule", 12);
    let rows: Vec<Vec<String>> = bundle
        .lookup("endorsements")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|e| {
                    let field = |key: &str| e.get(key).map(value_text).unwrap_or_default();
                    vec![
                        field("number"),
                        field("title"),
                        format::date(&field("effective_date")),
                    ]
                })
                .collect()
        })
        .unwrap_or_default();

    if rows.is_empty() {
        composer.paragraph("No endorsements attached.");
        return;
    }
    composer.grid(&[150, 264, 90], &["Number", "Title", "Effective"], &rows);
}

fn custom(composer: &mut Composer, bundle: &MergeBundle) {
    let Some(map) = bundle.lookup("custom").and_then(|v| v.as_object()) else {
        return;
    };
    for (key, value) in map {
        let label = key
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        composer.label_value(&label, &value_text(value));
    }
}

/// Lay out a spec against a bundle.
pub fn compose(spec: &LayoutSpec, bundle: &MergeBundle) -> Vec<Page> {
    let title = fill(&spec.title, bundle);
    let policy_number = bundle.text("policy.number");
    let mut composer = Composer::new(format!("{policy_number} {title}"));

    composer.heading(&title, 16);
    if let Some(subtitle) = &spec.subtitle {
        composer.text_at(
            MARGIN,
            PAGE_WIDTH - 2 * MARGIN,
            11,
            Font::Regular,
            &fill(subtitle, bundle),
        );
    }
    composer.rule();
    composer.gap(6);

    for section in &spec.sections {
        match section {
            Section::Metadata => metadata(&mut composer, bundle),
            Section::Coverages => coverages(&mut composer, bundle),
            Section::EndorsementSchedule => endorsement_schedule(&mut composer, bundle),
            Section::Paragraph { heading, text } => {
                if let Some(heading) = heading {
                    composer.heading(&fill(heading, bundle), 12);
                }
                composer.paragraph(&fill(text, bundle));
            }
            Section::Fields { heading, rows } => {
                if let Some(heading) = heading {
                    composer.heading(&fill(heading, bundle), 12);
                }
                for row in rows {
                    composer.label_value(&row.label, &formatted(bundle, &row.path, row.format));
                }
            }
            Section::Custom { heading } => {
                if let Some(heading) = heading {
                    composer.heading(&fill(heading, bundle), 12);
                }
                custom(&mut composer, bundle);
            }
        }
        composer.gap(8);
    }

    composer.finish(&policy_number)
}

//! Minimal PDF 1.4 writer for text documents.
//!
//! Only what license documents need: the standard Helvetica fonts (no
//! embedding, WinAnsi encoding), left-aligned lines, a couple of font sizes
//! and a horizontal rule. Long lines are word-wrapped at a fixed character
//! budget and content flows onto new pages at the bottom margin.

const PAGE_WIDTH: f32 = 612.0; // US Letter, points
const PAGE_HEIGHT: f32 = 792.0;
const MARGIN: f32 = 56.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Style {
    Title,
    Heading,
    Body,
    Small,
}

impl Style {
    fn font(self) -> &'static str {
        match self {
            Style::Title | Style::Heading => "/F2",
            Style::Body | Style::Small => "/F1",
        }
    }

    fn size(self) -> f32 {
        match self {
            Style::Title => 20.0,
            Style::Heading => 12.0,
            Style::Body => 10.0,
            Style::Small => 8.0,
        }
    }

    /// Approximate characters per line at this size (Helvetica averages ~0.5em).
    fn wrap_at(self) -> usize {
        ((PAGE_WIDTH - 2.0 * MARGIN) / (self.size() * 0.5)) as usize
    }
}

enum Item {
    Text(Style, String),
    Rule,
    Gap(f32),
}

#[derive(Default)]
pub struct Document {
    items: Vec<Item>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, style: Style, text: &str) -> &mut Self {
        for wrapped in wrap(text, style.wrap_at()) {
            self.items.push(Item::Text(style, wrapped));
        }
        self
    }

    pub fn rule(&mut self) -> &mut Self {
        self.items.push(Item::Rule);
        self
    }

    pub fn gap(&mut self, points: f32) -> &mut Self {
        self.items.push(Item::Gap(points));
        self
    }

    /// One content stream per page.
    fn pages(&self) -> Vec<Vec<u8>> {
        let mut pages = Vec::new();
        let mut out: Vec<u8> = Vec::new();
        let mut y = PAGE_HEIGHT - MARGIN;
        for item in &self.items {
            match item {
                Item::Text(style, text) => {
                    let size = style.size();
                    y -= size * 1.4;
                    if y < MARGIN {
                        pages.push(std::mem::take(&mut out));
                        y = PAGE_HEIGHT - MARGIN - size * 1.4;
                    }
                    out.extend_from_slice(
                        format!("BT {} {:.1} Tf {:.1} {:.1} Td (", style.font(), size, MARGIN, y).as_bytes(),
                    );
                    out.extend_from_slice(&escape(text));
                    out.extend_from_slice(b") Tj ET\n");
                }
                Item::Rule => {
                    y -= 6.0;
                    if y < MARGIN {
                        pages.push(std::mem::take(&mut out));
                        y = PAGE_HEIGHT - MARGIN - 6.0;
                    }
                    out.extend_from_slice(
                        format!(
                            "0.5 w {:.1} {:.1} m {:.1} {:.1} l S\n",
                            MARGIN,
                            y,
                            PAGE_WIDTH - MARGIN,
                            y
                        )
                        .as_bytes(),
                    );
                    y -= 4.0;
                }
                // A gap never starts a page on its own; the next line does.
                Item::Gap(points) => y = (y - points).max(MARGIN),
            }
        }
        pages.push(out);
        pages
    }

    /// Serialise to PDF bytes with a correct cross-reference table.
    pub fn render(&self) -> Vec<u8> {
        let pages = self.pages();
        // 1 catalog, 2 page tree, 3-4 fonts, then a page and its contents per page.
        let page_obj = |i: usize| 5 + 2 * i;
        let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", page_obj(i))).collect();

        let mut objects: Vec<Vec<u8>> = vec![
            b"<< /Type /Catalog /Pages 2 0 R >>".to_vec(),
            format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()).into_bytes(),
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_vec(),
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>".to_vec(),
        ];
        for (i, content) in pages.iter().enumerate() {
            objects.push(
                format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {} 0 R >>",
                    PAGE_WIDTH,
                    PAGE_HEIGHT,
                    page_obj(i) + 1
                )
                .into_bytes(),
            );
            let mut stream = format!("<< /Length {} >>\nstream\n", content.len()).into_bytes();
            stream.extend_from_slice(content);
            stream.extend_from_slice(b"endstream");
            objects.push(stream);
        }

        let mut pdf: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
        let mut offsets = Vec::with_capacity(objects.len());
        for (i, body) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
            pdf.extend_from_slice(body);
            pdf.extend_from_slice(b"\nendobj\n");
        }

        let xref_at = pdf.len();
        pdf.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
        pdf.extend_from_slice(b"0000000000 65535 f \n");
        for off in offsets {
            pdf.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
        }
        pdf.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                objects.len() + 1,
                xref_at
            )
            .as_bytes(),
        );
        pdf
    }
}

/// WinAnsi byte for `c`, if the encoding has it.
fn win_ansi(c: char) -> Option<u8> {
    let b = match c {
        ' '..='~' | '\u{A0}'..='\u{FF}' => return Some(c as u32 as u8),
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8A,
        '‹' => 0x8B,
        'Œ' => 0x8C,
        'Ž' => 0x8E,
        '\u{2018}' => 0x91,
        '\u{2019}' => 0x92,
        '\u{201C}' => 0x93,
        '\u{201D}' => 0x94,
        '•' => 0x95,
        '\u{2013}' => 0x96,
        '\u{2014}' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9A,
        '›' => 0x9B,
        'œ' => 0x9C,
        'ž' => 0x9E,
        'Ÿ' => 0x9F,
        _ => return None,
    };
    Some(b)
}

/// Encode a string as a WinAnsi PDF literal body. Characters the standard
/// fonts cannot show become `?`.
fn escape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            _ => out.push(win_ansi(c).unwrap_or(b'?')),
        }
    }
    out
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

//! Paginated document output (PDF 1.4, uncompressed content streams).
//!
//! Pages are written as soon as they are laid out; only the object offsets
//! are kept until the cross-reference table is emitted at the end.

use super::{Align, Cell, ReportRow, ReportViewModel};
use crate::error::MarksError;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

const CATALOG_ID: usize = 1;
const PAGES_ID: usize = 2;
const FONT_REGULAR_ID: usize = 3;
const FONT_BOLD_ID: usize = 4;
const INFO_ID: usize = 5;
const FIRST_PAGE_OBJ_ID: usize = 6;

/// Average Helvetica advance as a fraction of the font size.
const CHAR_EM: f64 = 0.5;
/// Helvetica digit advance (all digits share one width).
const DIGIT_EM: f64 = 0.556;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayout {
    pub width: f64,
    pub height: f64,
    pub margin: f64,
    pub font_size: f64,
    pub row_height: f64,
    /// Forces the number of body rows per page.
    pub rows_per_page: Option<usize>,
}

impl Default for PageLayout {
    /// A4 landscape.
    fn default() -> Self {
        Self {
            width: 842.0,
            height: 595.0,
            margin: 36.0,
            font_size: 9.0,
            row_height: 16.0,
            rows_per_page: None,
        }
    }
}

impl PageLayout {
    fn top(&self) -> f64 {
        self.height - self.margin
    }

    fn header_baseline(&self) -> f64 {
        self.top() - 52.0
    }

    fn body_floor(&self) -> f64 {
        self.margin + 10.0
    }

    fn footer_baseline(&self) -> f64 {
        (self.margin - 14.0).max(8.0)
    }

    /// Body rows that fit below the header; always at least one.
    pub fn row_capacity(&self) -> usize {
        if let Some(n) = self.rows_per_page {
            return n.max(1);
        }
        let usable = self.header_baseline() - self.body_floor();
        ((usable / self.row_height).floor() as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub rows: usize,
    pub pages: Option<usize>,
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct PdfWriter<W> {
    out: CountingWriter<W>,
    offsets: Vec<Option<u64>>,
}

impl<W: Write> PdfWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            out: CountingWriter { inner, written: 0 },
            offsets: Vec::new(),
        }
    }

    fn header(&mut self) -> std::io::Result<()> {
        self.out.write_all(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n")
    }

    fn object(&mut self, id: usize, body: &str) -> std::io::Result<()> {
        if self.offsets.len() <= id {
            self.offsets.resize(id + 1, None);
        }
        self.offsets[id] = Some(self.out.written);
        write!(self.out, "{} 0 obj\n{}\nendobj\n", id, body)
    }

    fn stream(&mut self, id: usize, content: &str) -> std::io::Result<()> {
        let body = format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        );
        self.object(id, &body)
    }

    fn finish(mut self) -> std::io::Result<()> {
        let xref_at = self.out.written;
        let size = self.offsets.len().max(1);
        write!(self.out, "xref\n0 {}\n0000000000 65535 f \n", size)?;
        for off in self.offsets.iter().skip(1) {
            match off {
                Some(o) => write!(self.out, "{:010} 00000 n \n", o)?,
                None => write!(self.out, "0000000000 65535 f \n")?,
            }
        }
        write!(
            self.out,
            "trailer\n<< /Size {} /Root {} 0 R /Info {} 0 R >>\nstartxref\n{}\n%%EOF\n",
            size, CATALOG_ID, INFO_ID, xref_at
        )?;
        self.out.flush()
    }
}

/// WinAnsiEncoding code points outside Latin-1.
const WIN_ANSI_EXTRA: [(char, u8); 8] = [
    ('\u{20AC}', 0x80),
    ('\u{2018}', 0x91),
    ('\u{2019}', 0x92),
    ('\u{201C}', 0x93),
    ('\u{201D}', 0x94),
    ('\u{2022}', 0x95),
    ('\u{2013}', 0x96),
    ('\u{2014}', 0x97),
];

fn win_ansi_byte(c: char) -> Option<u8> {
    match c as u32 {
        0xA0..=0xFF => Some(c as u32 as u8),
        _ => WIN_ANSI_EXTRA
            .iter()
            .find(|(ch, _)| *ch == c)
            .map(|(_, b)| *b),
    }
}

/// Literal string body for a WinAnsiEncoding font. Delimiters are escaped,
/// non-ASCII characters the encoding covers become octal escapes, and
/// anything else is shown as `?`.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            c if (' '..='~').contains(&c) => out.push(c),
            c => match win_ansi_byte(c) {
                Some(b) => out.push_str(&format!("\\{:03o}", b)),
                None => out.push('?'),
            },
        }
    }
    out
}

fn truncate_to(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut t: String = s.chars().take(keep).collect();
    t.push('~');
    t
}

struct ColumnGeometry {
    x: f64,
    width: f64,
    align: Align,
}

fn column_geometry(vm: &ReportViewModel, layout: &PageLayout) -> Vec<ColumnGeometry> {
    let char_w = layout.font_size * CHAR_EM;
    let printable = layout.width - 2.0 * layout.margin;
    let natural: f64 = vm.columns.iter().map(|c| c.width as f64 * char_w).sum();
    let scale = if natural > printable && natural > 0.0 {
        printable / natural
    } else {
        1.0
    };
    let mut x = layout.margin;
    vm.columns
        .iter()
        .map(|c| {
            let width = c.width as f64 * char_w * scale;
            let g = ColumnGeometry {
                x,
                width,
                align: c.align,
            };
            x += width;
            g
        })
        .collect()
}

fn text_op(out: &mut String, font: &str, size: f64, x: f64, y: f64, text: &str) {
    out.push_str(&format!(
        "BT /{} {:.2} Tf {:.2} {:.2} Td ({}) Tj ET\n",
        font,
        size,
        x,
        y,
        escape_text(text)
    ));
}

fn rule_op(out: &mut String, weight: f64, x1: f64, x2: f64, y: f64) {
    out.push_str(&format!(
        "{:.2} w {:.2} {:.2} m {:.2} {:.2} l S\n",
        weight, x1, y, x2, y
    ));
}

fn cell_text(cell: &Cell, geom: &ColumnGeometry, layout: &PageLayout) -> String {
    let text = cell.display();
    if cell.is_numeric() {
        return text;
    }
    let max_chars = (geom.width / (layout.font_size * CHAR_EM)).floor() as usize;
    truncate_to(&text, max_chars.max(1))
}

fn draw_row(
    out: &mut String,
    cells: &[Cell],
    bold: bool,
    geoms: &[ColumnGeometry],
    layout: &PageLayout,
    y: f64,
) {
    let font = if bold { "F2" } else { "F1" };
    for (cell, g) in cells.iter().zip(geoms) {
        let text = cell_text(cell, g, layout);
        let x = match g.align {
            Align::Left => g.x + 2.0,
            Align::Right => {
                let w = text.chars().count() as f64 * layout.font_size * DIGIT_EM;
                (g.x + g.width - 2.0 - w).max(g.x)
            }
        };
        text_op(out, font, layout.font_size, x, y, &text);
    }
}

fn page_content(
    vm: &ReportViewModel,
    rows: &[(&ReportRow, bool)],
    page_no: usize,
    geoms: &[ColumnGeometry],
    layout: &PageLayout,
    cancel: &AtomicBool,
) -> Result<String, MarksError> {
    let mut out = String::new();
    let left = layout.margin;
    let right = geoms.last().map(|g| g.x + g.width).unwrap_or(left);

    text_op(&mut out, "F2", 14.0, left, layout.top() - 14.0, &vm.title);
    text_op(&mut out, "F1", 10.0, left, layout.top() - 30.0, &vm.subtitle);

    let header: Vec<Cell> = vm
        .columns
        .iter()
        .map(|c| Cell::Text(c.title.clone()))
        .collect();
    let mut y = layout.header_baseline();
    draw_row(&mut out, &header, true, geoms, layout, y);
    rule_op(&mut out, 1.0, left, right, y - 4.0);

    for (row, summary) in rows {
        check_cancel(cancel)?;
        y -= layout.row_height;
        draw_row(&mut out, &row.cells, *summary, geoms, layout, y);
        rule_op(&mut out, 0.4, left, right, y - 4.0);
    }

    text_op(
        &mut out,
        "F1",
        8.0,
        left,
        layout.footer_baseline(),
        &format!("Generated {}    Page {}", vm.generated_at, page_no),
    );
    Ok(out)
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), MarksError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(MarksError::Render("render cancelled".into()));
    }
    Ok(())
}

pub fn render_document<W: Write>(
    vm: &ReportViewModel,
    out: W,
    layout: &PageLayout,
    cancel: &AtomicBool,
) -> Result<RenderStats, MarksError> {
    let geoms = column_geometry(vm, layout);
    let capacity = layout.row_capacity();
    let mut pdf = PdfWriter::new(out);
    pdf.header()?;

    pdf.object(
        CATALOG_ID,
        &format!("<< /Type /Catalog /Pages {} 0 R >>", PAGES_ID),
    )?;
    pdf.object(
        FONT_REGULAR_ID,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
    )?;
    pdf.object(
        FONT_BOLD_ID,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>",
    )?;
    pdf.object(
        INFO_ID,
        &format!(
            "<< /Title ({}) /Subject (digest {}) /Producer (marksheetd {}) /CreationDate (D:{}) >>",
            escape_text(&vm.title),
            vm.digest,
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().format("%Y%m%d%H%M%SZ"),
        ),
    )?;

    let all: Vec<(&ReportRow, bool)> = vm.all_rows().collect();
    let mut kids: Vec<usize> = Vec::new();
    let mut next_id = FIRST_PAGE_OBJ_ID;
    let mut rows_written = 0;

    // A report always has its summary rows, but keep one page for an empty
    // model too.
    let chunks: Vec<&[(&ReportRow, bool)]> = if all.is_empty() {
        vec![&all[..]]
    } else {
        all.chunks(capacity).collect()
    };

    for (i, chunk) in chunks.iter().enumerate() {
        check_cancel(cancel)?;
        let content = page_content(vm, chunk, i + 1, &geoms, layout, cancel)?;
        let content_id = next_id;
        let page_id = next_id + 1;
        next_id += 2;

        pdf.stream(content_id, &content)?;
        pdf.object(
            page_id,
            &format!(
                "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {:.0} {:.0}] \
                 /Resources << /Font << /F1 {} 0 R /F2 {} 0 R >> >> /Contents {} 0 R >>",
                PAGES_ID,
                layout.width,
                layout.height,
                FONT_REGULAR_ID,
                FONT_BOLD_ID,
                content_id
            ),
        )?;
        kids.push(page_id);
        rows_written += chunk.len();
    }

    let kids_ref = kids
        .iter()
        .map(|k| format!("{} 0 R", k))
        .collect::<Vec<_>>()
        .join(" ");
    pdf.object(
        PAGES_ID,
        &format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids_ref,
            kids.len()
        ),
    )?;
    pdf.finish()?;

    Ok(RenderStats {
        rows: rows_written,
        pages: Some(kids.len()),
    })
}

/// Strings drawn with `Tj`, in content order. Used to read numbers back out
/// of a rendered document.
#[cfg(test)]
pub fn shown_strings(pdf: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(pdf);
    let mut out = Vec::new();
    for line in text.lines() {
        let (Some(start), Some(end)) = (line.find(" Td ("), line.rfind(") Tj ET")) else {
            continue;
        };
        let raw = &line[start + 5..end];
        let mut s = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\\' {
                s.push(c);
                continue;
            }
            let mut code = 0u32;
            let mut digits = 0;
            while digits < 3 {
                match chars.peek().and_then(|d| d.to_digit(8)) {
                    Some(d) => {
                        code = code * 8 + d;
                        digits += 1;
                        chars.next();
                    }
                    None => break,
                }
            }
            if digits == 0 {
                if let Some(n) = chars.next() {
                    s.push(n);
                }
                continue;
            }
            let decoded = WIN_ANSI_EXTRA
                .iter()
                .find(|(_, b)| u32::from(*b) == code)
                .map(|(ch, _)| *ch)
                .or_else(|| char::from_u32(code));
            s.extend(decoded);
        }
        out.push(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::SqliteDirectory;
    use crate::report::build_class_report;
    use crate::report::tests::{filter, seeded_conn};
    use crate::store::SqliteMarkStore;

    fn class_vm() -> ReportViewModel {
        let conn = seeded_conn();
        let store = SqliteMarkStore::new(&conn);
        let dir = SqliteDirectory::new(&conn);
        build_class_report(&store, &dir, &filter(None)).unwrap()
    }

    #[test]
    fn document_is_well_formed() {
        let vm = class_vm();
        let mut buf = Vec::new();
        let stats =
            render_document(&vm, &mut buf, &PageLayout::default(), &AtomicBool::new(false))
                .unwrap();
        assert_eq!(stats.pages, Some(1));
        assert_eq!(stats.rows, 5);

        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.trim_end().ends_with("%%EOF"));
        assert!(text.contains("/BaseFont /Helvetica-Bold"));
        assert!(text.contains(&vm.digest));

        let strings = shown_strings(&buf);
        assert!(strings.contains(&"Grand Total".to_string()));
        assert!(strings.iter().any(|s| s.starts_with("Generated ")));
    }

    #[test]
    fn xref_offsets_point_at_objects() {
        let vm = class_vm();
        let mut buf = Vec::new();
        render_document(&vm, &mut buf, &PageLayout::default(), &AtomicBool::new(false)).unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();
        let xref = text.find("\nxref\n").unwrap();
        let mut checked = 0;
        for (id, line) in text[xref..].lines().skip(4).enumerate() {
            if !line.ends_with(" n ") {
                break;
            }
            let off: usize = line[..10].parse().unwrap();
            let expected = format!("{} 0 obj", id + 1);
            assert!(
                buf[off..].starts_with(expected.as_bytes()),
                "object {} offset mismatch",
                id + 1
            );
            checked += 1;
        }
        assert_eq!(checked, 7);
    }

    #[test]
    fn rows_never_split_across_pages() {
        let vm = class_vm();
        let layout = PageLayout {
            rows_per_page: Some(2),
            ..PageLayout::default()
        };
        let mut buf = Vec::new();
        let stats = render_document(&vm, &mut buf, &layout, &AtomicBool::new(false)).unwrap();
        // 3 students + 2 summary rows at 2 per page.
        assert_eq!(stats.pages, Some(3));
        assert_eq!(stats.rows, 5);

        let strings = shown_strings(&buf);
        let headers = strings.iter().filter(|s| *s == "Grand Total").count();
        assert_eq!(headers, 3);
        assert!(strings.iter().any(|s| s.ends_with("Page 3")));
    }

    #[test]
    fn default_capacity_fits_a4_landscape() {
        assert_eq!(PageLayout::default().row_capacity(), 28);
    }

    #[test]
    fn cancelled_render_stops() {
        let vm = class_vm();
        let mut buf = Vec::new();
        let err = render_document(&vm, &mut buf, &PageLayout::default(), &AtomicBool::new(true))
            .unwrap_err();
        assert_eq!(err.code(), "render_failed");
    }

    #[test]
    fn accented_names_survive_rendering() {
        let mut vm = class_vm();
        for row in &mut vm.rows {
            for cell in &mut row.cells {
                if *cell == Cell::Text("Aarav".into()) {
                    *cell = Cell::Text("Zoë".into());
                }
            }
        }
        let mut buf = Vec::new();
        render_document(&vm, &mut buf, &PageLayout::default(), &AtomicBool::new(false)).unwrap();
        assert!(String::from_utf8_lossy(&buf).contains("(Zo\\353)"));
        let shown = shown_strings(&buf);
        assert!(shown.contains(&"Zoë".to_string()));
        assert!(!shown.iter().any(|s| s.contains("Zo?")));
    }

    #[test]
    fn text_escaping() {
        assert_eq!(escape_text("a(b)c\\"), "a\\(b\\)c\\\\");
        assert_eq!(escape_text("Zoë"), "Zo\\353");
        assert_eq!(escape_text("Müller – 5€"), "M\\374ller \\226 5\\200");
        assert_eq!(escape_text("李"), "?");
        assert_eq!(truncate_to("abcdefgh", 5), "abcd~");
    }
}

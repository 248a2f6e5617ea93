//! Spreadsheet output (single-sheet XLSX).
//!
//! Numbers are written as numeric cells using the same text the document
//! renderer draws; everything else is an inline string.

use super::pdf::RenderStats;
use super::{Cell, ReportViewModel};
use crate::error::MarksError;
use std::io::{Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const STYLE_BOLD: u8 = 1;
const STYLE_DECIMAL: u8 = 2;
const STYLE_BOLD_DECIMAL: u8 = 3;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>
<Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>
</Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/>
</Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
</Relationships>"#;

// cellXfs: 0 default, 1 bold, 2 two-decimal, 3 bold two-decimal.
const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<numFmts count="1"><numFmt numFmtId="164" formatCode="0.00"/></numFmts>
<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>
<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>
<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>
<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>
<cellXfs count="4">
<xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/>
<xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/>
<xf numFmtId="164" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/>
<xf numFmtId="164" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1" applyNumberFormat="1"/>
</cellXfs>
</styleSheet>"#;

pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if (c as u32) < 0x20 && c != '\t' && c != '\n' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Zero-based column index to its letter reference (0 -> A, 26 -> AA).
pub fn column_letter(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

fn workbook_xml(sheet_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#,
        escape_xml(sheet_name)
    )
}

fn core_xml(vm: &ReportViewModel) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<dc:title>{}</dc:title>
<dc:subject>{}</dc:subject>
<dc:description>digest {}</dc:description>
<dc:creator>marksheetd {}</dc:creator>
<dcterms:created xsi:type="dcterms:W3CDTF">{}</dcterms:created>
</cp:coreProperties>"#,
        escape_xml(&vm.title),
        escape_xml(&vm.subtitle),
        vm.digest,
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

/// Sheet names are capped at 31 characters and may not contain `[]:*?/\`.
fn sheet_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .take(31)
        .collect();
    if cleaned.trim().is_empty() {
        "Report".to_string()
    } else {
        cleaned
    }
}

fn cell_xml(out: &mut String, reference: &str, cell: &Cell, bold: bool) {
    match cell {
        Cell::Int(_) => {
            let style = if bold { STYLE_BOLD } else { 0 };
            out.push_str(&format!(
                r#"<c r="{}" s="{}"><v>{}</v></c>"#,
                reference,
                style,
                cell.display()
            ));
        }
        Cell::Decimal(_) => {
            let style = if bold { STYLE_BOLD_DECIMAL } else { STYLE_DECIMAL };
            out.push_str(&format!(
                r#"<c r="{}" s="{}"><v>{}</v></c>"#,
                reference,
                style,
                cell.display()
            ));
        }
        Cell::Text(_) | Cell::Absent | Cell::Blank => {
            let style = if bold { STYLE_BOLD } else { 0 };
            out.push_str(&format!(
                r#"<c r="{}" s="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                reference,
                style,
                escape_xml(&cell.display())
            ));
        }
    }
}

fn row_xml(row_no: usize, cells: &[Cell], bold: bool) -> String {
    let mut out = format!(r#"<row r="{}">"#, row_no);
    for (i, cell) in cells.iter().enumerate() {
        let reference = format!("{}{}", column_letter(i), row_no);
        cell_xml(&mut out, &reference, cell, bold);
    }
    out.push_str("</row>\n");
    out
}

pub fn render_spreadsheet<W: Write + Seek>(
    vm: &ReportViewModel,
    out: W,
    cancel: &AtomicBool,
) -> Result<RenderStats, MarksError> {
    let mut zip = ZipWriter::new(out);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", opts)?;
    zip.write_all(CONTENT_TYPES.as_bytes())?;
    zip.start_file("_rels/.rels", opts)?;
    zip.write_all(ROOT_RELS.as_bytes())?;
    zip.start_file("xl/workbook.xml", opts)?;
    zip.write_all(workbook_xml(&sheet_name(&vm.title)).as_bytes())?;
    zip.start_file("xl/_rels/workbook.xml.rels", opts)?;
    zip.write_all(WORKBOOK_RELS.as_bytes())?;
    zip.start_file("xl/styles.xml", opts)?;
    zip.write_all(STYLES.as_bytes())?;
    zip.start_file("docProps/core.xml", opts)?;
    zip.write_all(core_xml(vm).as_bytes())?;

    zip.start_file("xl/worksheets/sheet1.xml", opts)?;
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetViews><sheetView workbookViewId="0"><pane ySplit="1" topLeftCell="A2" activePane="bottomLeft" state="frozen"/></sheetView></sheetViews>
"#,
    )?;
    let mut cols = String::from("<cols>");
    for (i, c) in vm.columns.iter().enumerate() {
        cols.push_str(&format!(
            r#"<col min="{n}" max="{n}" width="{w}" customWidth="1"/>"#,
            n = i + 1,
            w = c.width.max(4) + 2
        ));
    }
    cols.push_str("</cols>\n<sheetData>\n");
    zip.write_all(cols.as_bytes())?;

    let header: Vec<Cell> = vm
        .columns
        .iter()
        .map(|c| Cell::Text(c.title.clone()))
        .collect();
    zip.write_all(row_xml(1, &header, true).as_bytes())?;

    let mut rows = 0;
    for (row, summary) in vm.all_rows() {
        if cancel.load(Ordering::Relaxed) {
            return Err(MarksError::Render("render cancelled".into()));
        }
        rows += 1;
        zip.write_all(row_xml(rows + 1, &row.cells, summary).as_bytes())?;
    }
    zip.write_all(b"</sheetData>\n</worksheet>")?;
    let mut inner = zip.finish()?;
    inner.flush()?;

    Ok(RenderStats { rows, pages: None })
}

/// Values of numeric cells (`<v>`) in sheet order.
#[cfg(test)]
pub fn numeric_values(sheet_xml: &str) -> Vec<String> {
    sheet_xml
        .split("<v>")
        .skip(1)
        .filter_map(|chunk| chunk.split("</v>").next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::SqliteDirectory;
    use crate::report::pdf::{render_document, shown_strings, PageLayout};
    use crate::report::tests::{filter, seeded_conn};
    use crate::report::{build_class_report, build_subject_report};
    use crate::store::SqliteMarkStore;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    fn read_entry(bytes: &[u8], name: &str) -> String {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut s = String::new();
        entry.read_to_string(&mut s).unwrap();
        s
    }

    fn render_both(vm: &ReportViewModel) -> (Vec<u8>, Vec<u8>) {
        let cancel = AtomicBool::new(false);
        let mut pdf = Vec::new();
        render_document(vm, &mut pdf, &PageLayout::default(), &cancel).unwrap();
        let mut xlsx = Cursor::new(Vec::new());
        render_spreadsheet(vm, &mut xlsx, &cancel).unwrap();
        (pdf, xlsx.into_inner())
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn workbook_parts_present() {
        let conn = seeded_conn();
        let store = SqliteMarkStore::new(&conn);
        let dir = SqliteDirectory::new(&conn);
        let vm = build_subject_report(&store, &dir, &filter(Some("Maths"))).unwrap();
        let (_, xlsx) = render_both(&vm);

        let archive = ZipArchive::new(Cursor::new(xlsx.as_slice())).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        for part in [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/styles.xml",
            "xl/worksheets/sheet1.xml",
            "docProps/core.xml",
        ] {
            assert!(names.contains(&part), "missing {}", part);
        }

        let sheet = read_entry(&xlsx, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains(r#"<c r="A1" s="1" t="inlineStr"><is><t>Roll No</t></is></c>"#));
        assert!(sheet.contains(r#"<row r="6">"#));
        assert!(!sheet.contains(r#"<row r="7">"#));
        assert!(sheet.contains("<t>AB</t>"));

        let core = read_entry(&xlsx, "docProps/core.xml");
        assert!(core.contains(&format!("digest {}", vm.digest)));
    }

    #[test]
    fn numbers_match_document() {
        let conn = seeded_conn();
        let store = SqliteMarkStore::new(&conn);
        let dir = SqliteDirectory::new(&conn);
        for vm in [
            build_subject_report(&store, &dir, &filter(Some("Maths"))).unwrap(),
            build_class_report(&store, &dir, &filter(None)).unwrap(),
        ] {
            let (pdf, xlsx) = render_both(&vm);
            let sheet = read_entry(&xlsx, "xl/worksheets/sheet1.xml");
            let from_sheet = numeric_values(&sheet);
            let from_pdf: Vec<String> = shown_strings(&pdf)
                .into_iter()
                .filter(|s| s.parse::<f64>().is_ok())
                .collect();
            assert!(!from_sheet.is_empty());
            assert_eq!(from_pdf, from_sheet);

            let pdf_text = String::from_utf8_lossy(&pdf);
            assert!(pdf_text.contains(&vm.digest));
            assert!(read_entry(&xlsx, "docProps/core.xml").contains(&vm.digest));
        }
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_xml("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
        assert_eq!(sheet_name("Maths: unit1 [A]"), "Maths_ unit1 _A_");
    }
}

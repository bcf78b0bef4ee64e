//! Report and message builders shared by unit tests.

use std::io::{Cursor, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use zip::write::SimpleFileOptions;

pub const FASTMAIL_GZ: &str = "fastmail.com!example.com!1573603200!1573689599!261425809.xml.gz";
pub const GOOGLE_ZIP: &str = "google.com!example.com!1585958400!1586044799.zip";

/// One `<record>`: source ip, count, evaluated dkim, evaluated spf.
pub type Row<'a> = (&'a str, u64, &'a str, &'a str);

pub fn report_xml(org: &str, rows: &[Row<'_>], errors: &[&str]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<feedback>\n  <report_metadata>\n    \
         <org_name>{org}</org_name>\n    <email>noreply@example.net</email>\n    \
         <report_id>261425809</report_id>\n    <date_range>\n      <begin>1573603200</begin>\n      \
         <end>1573689599</end>\n    </date_range>\n"
    );
    for error in errors {
        xml.push_str(&format!("    <error>{error}</error>\n"));
    }
    xml.push_str(
        "  </report_metadata>\n  <policy_published>\n    <domain>example.com</domain>\n    \
         <p>none</p>\n  </policy_published>\n",
    );
    for (ip, count, dkim, spf) in rows {
        xml.push_str(&format!(
            "  <record>\n    <row>\n      <source_ip>{ip}</source_ip>\n      <count>{count}</count>\n      \
             <policy_evaluated>\n        <disposition>none</disposition>\n        <dkim>{dkim}</dkim>\n        \
             <spf>{spf}</spf>\n      </policy_evaluated>\n    </row>\n    <identifiers>\n      \
             <header_from>example.com</header_from>\n    </identifiers>\n  </record>\n"
        ));
    }
    xml.push_str("</feedback>\n");
    xml
}

/// The single-record report Fastmail sent for example.com.
pub fn fastmail_report() -> String {
    report_xml("Fastmail Pty Ltd", &[("64.147.123.24", 1, "pass", "pass")], &[])
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn zip(entry: &str, data: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(entry, SimpleFileOptions::default()).unwrap();
    writer.write_all(data).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Base64 wrapped at 76 columns with CRLF line breaks.
pub fn base64_lines(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(76)
        .map(|line| format!("{}\r\n", String::from_utf8_lossy(line)))
        .collect()
}

/// A single-part message whose body is the base64-encoded file.
pub fn single_part_message(disposition: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    format!(
        "From: noreply-dmarc-support@example.net\r\n\
         To: dmarc@example.com\r\n\
         Subject: Report Domain: example.com\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: application/octet-stream;\r\n\tname=\"{filename}\"\r\n\
         Content-Disposition: {disposition};\r\n\tfilename=\"{filename}\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {}",
        base64_lines(content)
    )
    .into_bytes()
}

/// A multipart message: a text part, the attachment, then a trailing part.
pub fn multipart_message(filename: &str, content: &[u8]) -> Vec<u8> {
    format!(
        "From: noreply-dmarc-support@example.net\r\n\
         Subject: Report Domain: example.com\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"000000000000b0a1c205a27dd4f3\"\r\n\
         \r\n\
         --000000000000b0a1c205a27dd4f3\r\n\
         Content-Type: text/plain; charset=\"UTF-8\"\r\n\
         \r\n\
         This is an aggregate report.\r\n\
         \r\n\
         --000000000000b0a1c205a27dd4f3\r\n\
         Content-Type: application/zip;\r\n\tname=\"{filename}\"\r\n\
         Content-Disposition: attachment;\r\n\tfilename=\"{filename}\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {}\
         --000000000000b0a1c205a27dd4f3\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         trailing part\r\n\
         --000000000000b0a1c205a27dd4f3--\r\n",
        base64_lines(content)
    )
    .into_bytes()
}

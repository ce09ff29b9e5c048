use std::io::Write;

use anyhow::Result;
use bytes::Bytes;

use ingest::source::{ChunkSource, ReaderSource};
use ingest::*;

mod common;
use common::*;

#[derive(Debug, PartialEq, Eq)]
struct Decoded {
    path: String,
    is_dir: bool,
    declared_size: Option<u64>,
    content: Bytes,
}

async fn decode_all<S: source::ByteSource>(source: S, format: ArchiveFormat) -> Result<Vec<Decoded>> {
    let mut reader = ArchiveReader::new(source, format, DecoderOptions::default());
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        entries.push(Decoded {
            path: entry.path,
            is_dir: entry.is_dir,
            declared_size: entry.declared_size,
            content: entry.content.read_all()?,
        });
    }
    Ok(entries)
}

fn sample_files() -> Vec<(String, Vec<u8>)> {
    let mut files = vec![
        ("project/".to_owned(), Vec::new()),
        ("project/empty".to_owned(), Vec::new()),
        ("project/exactly-one-block.txt".to_owned(), vec![b'z'; 512]),
    ];
    for i in 0..10 {
        let body = format!("line {i}\n").repeat(i * 40);
        files.push((format!("project/src/{i}.txt"), body.into_bytes()));
    }
    files
}

#[tokio::test]
async fn tar_one_byte_at_a_time() -> Result<()> {
    init_logging();
    let files = sample_files();
    let entries: Vec<(&str, &[u8])> = files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();

    for (archive, format) in [
        (tar(&entries), ArchiveFormat::Tar),
        (gzip(&tar(&entries)), ArchiveFormat::TarGz),
    ] {
        let whole = decode_all(ChunkSource::split(archive.clone(), archive.len()), format).await?;
        let bytewise = decode_all(ChunkSource::split(archive, 1), format).await?;
        assert_eq!(whole.len(), files.len());
        assert_eq!(whole, bytewise);

        assert!(whole[0].is_dir);
        assert_eq!(whole[1].declared_size, Some(0));
        assert_eq!(whole[2].content.len(), 512);
    }
    Ok(())
}

#[tokio::test]
async fn zip_one_byte_at_a_time() -> Result<()> {
    init_logging();
    let files = sample_files();
    let entries: Vec<(&str, &[u8], Method)> = files
        .iter()
        .enumerate()
        .map(|(i, (n, d))| {
            let method = if i % 2 == 0 { Method::Deflate } else { Method::Stored };
            (n.as_str(), d.as_slice(), method)
        })
        .collect();
    let archive = zip(&entries);

    let whole = decode_all(ChunkSource::split(archive.clone(), archive.len()), ArchiveFormat::Zip).await?;
    let bytewise = decode_all(ChunkSource::split(archive, 1), ArchiveFormat::Zip).await?;
    assert_eq!(whole, bytewise);

    let paths: Vec<&str> = whole.iter().map(|e| e.path.as_str()).collect();
    let expected: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(paths, expected);
    for (entry, (_, data)) in whole.iter().zip(&files) {
        assert_eq!(&entry.content[..], &data[..]);
    }
    Ok(())
}

#[tokio::test]
async fn crc_verification() -> Result<()> {
    init_logging();
    let mut archive = zip(&[("a.txt", b"checked", Method::Stored)]);
    // Corrupt the content (after the 30-byte header and 5-byte name).
    archive[35] ^= 0xff;

    let source = ChunkSource::split(archive.clone(), 7);
    let mut reader = ArchiveReader::new(source, ArchiveFormat::Zip, DecoderOptions::default());
    let entry = reader.next_entry().await?.unwrap();
    assert!(entry.content.read_all().is_ok());

    let options = DecoderOptions {
        verify_crc: true,
        ..Default::default()
    };
    let mut reader = ArchiveReader::new(ChunkSource::split(archive, 7), ArchiveFormat::Zip, options);
    let entry = reader.next_entry().await?.unwrap();
    let err = entry.content.read_all().unwrap_err();
    assert!(err.to_string().contains("Invalid checksum"), "{err}");
    Ok(())
}

#[tokio::test]
async fn pipeline_over_a_file() -> Result<()> {
    init_logging();
    let archive = gzip(&tar(&[
        ("repo/", b""),
        ("repo/README.md", b"# Read me"),
        ("repo/src/lib.rs", b"pub fn f() {}"),
    ]));
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&archive)?;
    file.flush()?;

    let archive_file = tokio::fs::File::open(file.path()).await?;
    let (writer, mut reader) = tokio::io::duplex(4096);
    let encoder = MultipartEncoder::with_boundary(writer, BOUNDARY.to_owned());
    let config = FilterConfiguration::from_query("omitFirstSegment&pathPatterns=src");

    let (stats, out) = tokio::join!(
        PipelineDriver::new(config).run(ReaderSource::with_chunk_size(archive_file, 16), encoder),
        async {
            let mut out = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
                .await
                .map(|_| out)
        }
    );
    let stats = stats?;
    let parts = parse_multipart(&out?, BOUNDARY)?;

    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].header("x-filter"), Some("ingesttar;404;Not included"));
    assert_eq!(parts[1].name(), "src/lib.rs");
    assert_eq!(parts[1].body, b"pub fn f() {}");
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.bodies, 1);
    Ok(())
}

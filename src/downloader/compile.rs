//! Sequential assembly of part files into the final output.

use std::io::ErrorKind as IoErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::error::DownloadError;
use crate::events::DownloadHandler;
use crate::item::{Item, UNKNOWN_SIZE};

const COMPILE_BUF_SIZE: usize = 256 * 1024;

/// Appends every uncompiled part to the final file in original-offset order,
/// marking each `compiled` and unlinking its temporary file before moving to
/// the next. Strictly sequential; returns the final file's byte count.
pub(crate) async fn compile_parts(
    item: &Arc<Item>,
    handler: &Arc<dyn DownloadHandler>,
    overwrite: bool,
) -> Result<u64, DownloadError> {
    // Snapshot the plan under the lock, then do all I/O outside it.
    let plan: Vec<(i64, String, bool, i64)> = {
        let parts = item.parts.read().expect("parts lock poisoned");
        parts
            .iter()
            .map(|(ioff, p)| {
                (
                    *ioff,
                    p.hash.clone(),
                    p.is_compiled(),
                    p.final_offset.load(Ordering::Acquire),
                )
            })
            .collect()
    };

    let out_path = item.output_path();
    let compiled_bytes: u64 = plan
        .iter()
        .filter(|(_, _, compiled, _)| *compiled)
        .map(|(ioff, _, _, foff)| (foff - ioff) as u64)
        .sum();
    let resuming_compile = compiled_bytes > 0;

    let file = if resuming_compile {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&out_path)
            .await?;
        // Cut back to the last known-good part boundary in case an earlier
        // compile died mid-append.
        file.set_len(compiled_bytes).await?;
        let mut file = file;
        file.seek(std::io::SeekFrom::End(0)).await?;
        file
    } else {
        if !overwrite && tokio::fs::try_exists(&out_path).await.unwrap_or(false) {
            return Err(DownloadError::Disk(std::io::Error::new(
                IoErrorKind::AlreadyExists,
                format!("output file {} already exists", out_path.display()),
            )));
        }
        tokio::fs::File::create(&out_path).await?
    };

    let mut writer = BufWriter::with_capacity(COMPILE_BUF_SIZE, file);
    let mut total = compiled_bytes;
    let mut buf = vec![0u8; COMPILE_BUF_SIZE];

    for (ioff, hash, compiled, _) in &plan {
        if *compiled {
            continue;
        }

        handler.on_compile_start(hash).await;
        let part_path = item.part_path(hash);
        let mut reader = tokio::fs::File::open(&part_path).await?;
        let mut part_total: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            part_total += n as u64;
            handler.on_compile_progress(hash, n as u64).await;
        }

        // The part's bytes must be durable in the output before the part
        // file goes away.
        writer.flush().await?;

        {
            let parts = item.parts.read().expect("parts lock poisoned");
            if let Some(part) = parts.get(ioff) {
                part.compiled.store(true, Ordering::Release);
            }
        }
        if let Err(e) = tokio::fs::remove_file(&part_path).await {
            log::warn!(
                "[compile_parts] failed to remove part file {}: {}",
                part_path.display(),
                e
            );
        }

        handler.on_compile_complete(hash, part_total).await;
        total += part_total;
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;

    if item.total_size() == UNKNOWN_SIZE {
        item.total_size.store(total as i64, Ordering::Release);
    }

    Ok(total)
}

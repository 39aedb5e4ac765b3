//! Console log tailer (spec.md §4.4, §9 "subprocess-with-console-
//! scraping").
//!
//! Adapted from the teacher's `git.rs::watch_refs`: there, a `notify`
//! watcher on `.git` debounces filesystem events into a rescanned
//! `rev-list`. Here the same shape watches a growing VM console log file
//! and debounces writes into a rescan of the newly-appended tail for a
//! crash-starter pattern, so the Test Worker can react to a crash while
//! the test's own polling loop might otherwise wait out a long timeout.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::pin::pin;
use std::time::Duration;

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::{future::Fuse, select, FutureExt, SinkExt as _, StreamExt as _};
use futures_core::stream::Stream;
use futures_core::FusedFuture;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::time::sleep;

use crate::crash_analyzer::CRASH_STARTERS;

/// A sighting of a crash-starter pattern in the console tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleAlert {
    pub matched_pattern: &'static str,
    pub tail: String,
}

/// Serial console output regularly carries ANSI colour codes (kernel
/// `printk` colourisation, bootloader banners); stripped before pattern
/// matching so a colour escape sequence can't split a crash-starter line.
fn strip_ansi(text: &str) -> String {
    let stripped = strip_ansi_escapes::strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).into_owned()
}

fn scan_tail_for_crash(tail: &str) -> Option<ConsoleAlert> {
    let tail = strip_ansi(tail);
    tail.lines().find_map(|line| {
        CRASH_STARTERS
            .iter()
            .find(|starter| line.trim_start().starts_with(**starter))
            .map(|matched| ConsoleAlert {
                matched_pattern: matched,
                tail: tail.to_string(),
            })
    })
}

/// Watches `console_path` for appended content, debouncing bursts of
/// writes into a single rescan of the newly-written bytes (1s window,
/// same as the teacher's `watch_refs`). Yields an alert the first time a
/// crash-starter line appears in a rescanned chunk; returns nothing when
/// the file is quiet.
pub fn watch_console<'a>(
    console_path: &'a Path,
) -> Result<(
    RecommendedWatcher,
    impl Stream<Item = Result<ConsoleAlert>> + 'a,
)> {
    let (mut tx, mut rx) = futures::channel::mpsc::unbounded();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            futures::executor::block_on(async {
                let _ = tx.send(res).await;
            })
        },
        Config::default(),
    )?;
    watcher
        .watch(console_path, RecursiveMode::NonRecursive)
        .context("watching console log")?;

    let mut offset: u64 = 0;

    Ok((
        watcher,
        try_stream! {
            let mut sleep_fut = pin!(Fuse::terminated());
            loop {
                let mut tail_result = None;
                select! {
                    () = sleep_fut => {
                        tail_result = Some(read_new_tail(console_path, &mut offset));
                    },
                    maybe_result = rx.next() => {
                        match maybe_result {
                            Some(_result) => {
                                if sleep_fut.is_terminated() {
                                    sleep_fut.set(sleep(Duration::from_secs(1)).fuse());
                                }
                            }
                            None => break,
                        }
                    }
                }
                if let Some(result) = tail_result {
                    if let Some(alert) = result? {
                        yield alert;
                    }
                }
            }
        },
    ))
}

fn read_new_tail(path: &Path, offset: &mut u64) -> Result<Option<ConsoleAlert>> {
    let mut file = std::fs::File::open(path).context("opening console log")?;
    let len = file.metadata()?.len();
    if len < *offset {
        // The log was truncated/rotated; rescan from the top.
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).context("reading console tail")?;
    *offset = len;
    Ok(scan_tail_for_crash(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration as StdDuration;

    #[test]
    fn scan_ignores_clean_output() {
        assert_eq!(scan_tail_for_crash("all good\nnothing here\n"), None);
    }

    #[test]
    fn scan_detects_crash_starter_line() {
        let alert = scan_tail_for_crash("normal line\nkernel BUG at foo.c:1!\n").unwrap();
        assert_eq!(alert.matched_pattern, "kernel BUG at ");
    }

    #[tokio::test]
    async fn watch_console_detects_appended_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "boot ok\n").unwrap();

        let (_watcher, stream) = watch_console(&path).unwrap();
        let mut stream = pin!(stream);

        let path_clone = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path_clone)
                .unwrap();
            writeln!(f, "kernel BUG at oops.c:1!").unwrap();
        });

        let alert = tokio::time::timeout(StdDuration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for alert")
            .expect("stream ended without an alert")
            .unwrap();
        assert_eq!(alert.matched_pattern, "kernel BUG at ");
    }
}

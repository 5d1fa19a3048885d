use parpipe::{
    Document, LinePipeline, OrderedDocumentCache, PoolConfig, PoolError, SharedOutput,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn config(workers: i64, max_words: usize) -> PoolConfig {
    PoolConfig::builder()
        .workers(workers)
        .max_words_per_part(max_words)
        .helper_poll_timeout(Duration::from_millis(5))
        .max_wait_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
}

fn remove_stop_words(text: &str) -> anyhow::Result<String> {
    let stop: HashSet<&str> = ["the", "a", "of"].into_iter().collect();
    Ok(text
        .split(' ')
        .filter(|word| !stop.contains(word.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" "))
}

#[test]
fn pipeline_reads_a_file_and_preserves_line_order() {
    let mut input = tempfile::NamedTempFile::new().unwrap();
    let mut expected = String::new();
    for i in 0..120 {
        match i % 5 {
            0 => {
                writeln!(input).unwrap();
                expected.push('\n');
            }
            1 => {
                // every word is removed: the line stays as a blank line
                writeln!(input, "the of a").unwrap();
                expected.push('\n');
            }
            _ => {
                writeln!(input, "the  history of line {}", i).unwrap();
                expected.push_str(&format!("history line {}\n", i));
            }
        }
    }
    input.flush().unwrap();

    let reader = BufReader::new(File::open(input.path()).unwrap());
    let output = SharedOutput::new();
    let pipeline = LinePipeline::new(config(3, 100), remove_stop_words).unwrap();
    let summary = pipeline.run(reader, output.clone()).unwrap();

    assert_eq!(output.to_string_lossy(), expected);
    assert_eq!(summary.lines, 120);
    assert_eq!(summary.parts, 120);
    assert_eq!(summary.helped + summary.delegated, 96);
}

#[test]
fn long_lines_are_split_and_rejoined() {
    let line: Vec<String> = (0..10).map(|i| format!("w{}", i)).collect();
    let input = format!("{}\nshort\n", line.join(" "));

    let output = SharedOutput::new();
    let pipeline = LinePipeline::new(config(2, 3), |text: &str| -> anyhow::Result<String> {
        Ok(text.to_string())
    })
    .unwrap();
    let summary = pipeline.run(input.as_bytes(), output.clone()).unwrap();

    assert_eq!(output.to_string_lossy(), input);
    assert_eq!(summary.lines, 2);
    assert_eq!(summary.parts, 5);
}

#[test]
fn oversized_parts_bypass_the_cache() {
    let config = PoolConfig::builder()
        .workers(3)
        .max_part_size(16)
        .helper_poll_timeout(Duration::from_millis(5))
        .build()
        .unwrap();
    let input = "tiny\nthis line is far longer than sixteen bytes\nsmall\n\n";

    let output = SharedOutput::new();
    let pipeline = LinePipeline::new(config, |text: &str| -> anyhow::Result<String> {
        Ok(text.to_string())
    })
    .unwrap();
    let summary = pipeline.run(input.as_bytes(), output.clone()).unwrap();

    assert_eq!(output.to_string_lossy(), input);
    assert!(summary.helped >= 1);
}

#[test]
fn transform_failure_is_surfaced() {
    let input: String = (0..50).map(|i| format!("line {}\n", i)).collect();
    let pipeline = LinePipeline::new(config(3, 100), |text: &str| -> anyhow::Result<String> {
        if text == "line 33" {
            anyhow::bail!("unknown word form");
        }
        Ok(text.to_string())
    })
    .unwrap();

    let err = pipeline.run(input.as_bytes(), SharedOutput::new()).unwrap_err();
    match err {
        PoolError::WorkerExecution { source, .. } => {
            assert_eq!(source.to_string(), "unknown word form")
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// Serves its bytes, then fails instead of reporting end of input
struct FailsAtEnd(Cursor<Vec<u8>>);

impl Read for FailsAtEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::Other, "device detached")),
            n => Ok(n),
        }
    }
}

#[test]
fn read_failure_stops_the_workers() {
    let config = PoolConfig::builder()
        .workers(2)
        .helper_lead_factor(4)
        .helper_poll_timeout(Duration::from_millis(5))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pipeline = LinePipeline::new(config, move |text: &str| -> anyhow::Result<String> {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        Ok(text.to_string())
    })
    .unwrap();

    let input: String = (0..40).map(|i| format!("word {}\n", i)).collect();
    let reader = BufReader::new(FailsAtEnd(Cursor::new(input.into_bytes())));
    let err = pipeline.run(reader, SharedOutput::new()).unwrap_err();
    assert!(matches!(err, PoolError::Io { .. }));

    // queued parts are dropped; only a part already fetched may still run
    let at_return = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(300));
    assert!(calls.load(Ordering::SeqCst) - at_return <= 1);
}

#[test]
fn concurrent_producers_emit_in_index_order() {
    let total = 300u64;
    let cache = Arc::new(OrderedDocumentCache::new(SharedOutput::new()));
    let output = cache.with_output(|out| out.clone());

    // every third index is a gap
    let present: Vec<u64> = (0..total).filter(|i| i % 3 != 0).collect();
    for &index in &present {
        cache.wait_for(index).unwrap();
    }

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let cache = Arc::clone(&cache);
            let mine: Vec<u64> = present.iter().copied().filter(|i| i % 4 == p).collect();
            thread::spawn(move || {
                for index in mine.into_iter().rev() {
                    cache.cache_doc(index, Document::line(format!("d{}", index))).unwrap();
                    cache.cache_write().unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    cache.cache_write().unwrap();
    cache.finish(total).unwrap();

    let expected: String = (0..total)
        .map(|i| if i % 3 == 0 { "\n".to_string() } else { format!("d{}\n", i) })
        .collect();
    assert_eq!(output.to_string_lossy(), expected);
    assert_eq!(cache.last_written(), Some(total - 1));
}

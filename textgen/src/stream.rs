use crate::types::{AdapterError, StopSpecification};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Byte range of a stop-string occurrence within a text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopMatch {
    pub start: usize,
    pub end: usize,
}

/// Find the winning stop match in `text`: the earliest-starting occurrence of
/// any stop string; ties at the same start position go to the longest stop
/// string, so `"stopword"` beats `"stop"` when both begin at the same offset.
pub fn find_stop_match(text: &str, stops: &[String]) -> Option<StopMatch> {
    let mut best: Option<StopMatch> = None;
    for stop in stops {
        if stop.is_empty() {
            continue;
        }
        if let Some(start) = text.find(stop.as_str()) {
            let candidate = StopMatch {
                start,
                end: start + stop.len(),
            };
            best = Some(match best {
                Some(current)
                    if current.start < candidate.start
                        || (current.start == candidate.start
                            && current.end >= candidate.end) =>
                {
                    current
                }
                _ => candidate,
            });
        }
    }
    best
}

/// One-shot truncation for the blocking path: cut `text` before the winning
/// stop match. The flag reports whether a stop string was found.
pub fn truncate_at_stop(text: &str, stops: &[String]) -> (String, bool) {
    match find_stop_match(text, stops) {
        Some(m) => (text[..m.start].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Boxed stream of text increments produced by a generation worker.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AdapterError>> + Send>>;

/// Lazy truncating wrapper over a stream of text increments.
///
/// Increments are forwarded as they arrive, but each one is first appended to
/// a cumulative buffer which is checked for stop strings, so a stop split
/// across increment boundaries is still caught. On a match the stream yields
/// only the not-yet-forwarded text before the match start (nothing, if the
/// match begins inside already-forwarded text) and then ends; remaining
/// upstream increments are never polled. An upstream error is forwarded once
/// and ends the stream. Finite and not restartable.
pub struct StopStream {
    inner: TokenStream,
    stops: Vec<String>,
    buffer: String,
    emitted: usize,
    done: bool,
}

impl StopStream {
    pub fn new(inner: TokenStream, stop: &StopSpecification) -> Self {
        Self {
            inner,
            stops: stop.entries().to_vec(),
            buffer: String::new(),
            emitted: 0,
            done: false,
        }
    }
}

impl Stream for StopStream {
    type Item = Result<String, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Some(Ok(increment))) => {
                    this.buffer.push_str(&increment);
                    if let Some(m) = find_stop_match(&this.buffer, &this.stops) {
                        this.done = true;
                        if m.start > this.emitted {
                            let out = this.buffer[this.emitted..m.start].to_string();
                            this.emitted = m.start;
                            return Poll::Ready(Some(Ok(out)));
                        }
                        return Poll::Ready(None);
                    }
                    if this.buffer.len() > this.emitted {
                        let out = this.buffer[this.emitted..].to_string();
                        this.emitted = this.buffer.len();
                        return Poll::Ready(Some(Ok(out)));
                    }
                    // Empty increment, poll upstream again.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn stops(entries: &[&str]) -> StopSpecification {
        StopSpecification::new(entries.to_vec()).unwrap()
    }

    fn increments(parts: &[&str]) -> TokenStream {
        let items: Vec<Result<String, AdapterError>> =
            parts.iter().map(|s| Ok(s.to_string())).collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn collect_text(stream: StopStream) -> String {
        stream
            .map(|item| item.unwrap())
            .collect::<Vec<String>>()
            .await
            .concat()
    }

    #[tokio::test]
    async fn test_stop_spanning_increment_boundary() {
        let stream = StopStream::new(increments(&["ab", "c", "de"]), &stops(&["cd"]));
        assert_eq!(collect_text(stream).await, "abc");
    }

    #[tokio::test]
    async fn test_stop_at_increment_boundary_withholds_tail() {
        let stream = StopStream::new(increments(&["ab", "cde"]), &stops(&["cd"]));
        assert_eq!(collect_text(stream).await, "ab");
    }

    #[tokio::test]
    async fn test_passthrough_without_stop_is_identity() {
        let parts = ["hello ", "wor", "ld"];
        let stream = StopStream::new(increments(&parts), &stops(&["zz"]));
        assert_eq!(collect_text(stream).await, "hello world");
    }

    #[tokio::test]
    async fn test_no_yield_after_stop_match() {
        let stream = StopStream::new(
            increments(&["one", "two STOP", "never", "seen"]),
            &stops(&["STOP"]),
        );
        assert_eq!(collect_text(stream).await, "onetwo ");
    }

    #[tokio::test]
    async fn test_longest_match_wins_at_same_start() {
        let stream = StopStream::new(
            increments(&["Answer: done", "stopword more text"]),
            &stops(&["stop", "stopword"]),
        );
        assert_eq!(collect_text(stream).await, "Answer: done");
    }

    #[tokio::test]
    async fn test_error_is_forwarded_and_terminates() {
        let items: Vec<Result<String, AdapterError>> = vec![
            Ok("partial".to_string()),
            Err(AdapterError::Backend("worker failed".to_string())),
            Ok("unreachable".to_string()),
        ];
        let mut stream = StopStream::new(
            Box::pin(futures::stream::iter(items)),
            &stops(&["zz"]),
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(
            stream.next().await,
            Some(Err(AdapterError::Backend(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_increments_are_skipped() {
        let stream = StopStream::new(increments(&["", "a", "", "b"]), &stops(&[]));
        assert_eq!(collect_text(stream).await, "ab");
    }

    #[test]
    fn test_find_stop_match_earliest_start() {
        let stops = vec!["later".to_string(), "ear".to_string()];
        let m = find_stop_match("ear then later", &stops).unwrap();
        assert_eq!((m.start, m.end), (0, 3));
    }

    #[test]
    fn test_find_stop_match_tie_break_longest() {
        let stops = vec!["stop".to_string(), "stopword".to_string()];
        let m = find_stop_match("Answer: donestopword more text", &stops).unwrap();
        assert_eq!(m.start, 12);
        assert_eq!(m.end, 12 + "stopword".len());
    }

    #[test]
    fn test_truncate_at_stop_blocking_path() {
        let stops = vec!["stop".to_string(), "stopword".to_string()];
        let (text, matched) = truncate_at_stop("Answer: donestopword more text", &stops);
        assert_eq!(text, "Answer: done");
        assert!(matched);

        let (text, matched) = truncate_at_stop("no match here", &stops);
        assert_eq!(text, "no match here");
        assert!(!matched);
    }
}

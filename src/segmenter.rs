//! Streaming sentence segmentation.
//!
//! Participants stream their utterances a few characters at a time. The
//! segmenter keeps one buffer per speaker and carves it into
//! punctuation-terminated [`SentenceChunk`]s as soon as a sentence is known
//! to be finished, holding back the newest segment until more text (or the
//! end-of-utterance marker) arrives.
//!
//! Text is never dropped or duplicated: the chunks emitted for a speaker
//! followed by whatever remains in its buffer always equal the fragments
//! received since the last reset, up to whitespace trimmed at chunk edges.

use crate::config::SegmenterConfig;
use crate::error::Result;
use crate::node::{InputEvent, Node, NodeEvent, NodeIo, OutputSender, log_send_error};
use crate::pipeline::control::ControlCommand;
use crate::pipeline::messages::{SentenceChunk, SpeakerId, TextFragment};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const NODE_TAG: &str = "SEGMENTER";

/// Set of characters that close a sentence chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunctuationSet(Vec<char>);

impl PunctuationSet {
    #[must_use]
    pub fn new(chars: &str) -> Self {
        Self(chars.chars().collect())
    }

    #[must_use]
    pub fn contains(&self, c: char) -> bool {
        self.0.contains(&c)
    }
}

impl Default for PunctuationSet {
    fn default() -> Self {
        Self::new(&SegmenterConfig::default().punctuation)
    }
}

/// Result of one left-to-right scan over a buffer.
#[derive(Debug, PartialEq, Eq)]
struct Scan<'a> {
    /// Trimmed, non-empty segments each ending in punctuation.
    closed: Vec<String>,
    /// Untrimmed text after the last punctuation mark.
    tail: &'a str,
}

impl Scan<'_> {
    fn tail_is_blank(&self) -> bool {
        self.tail.trim().is_empty()
    }

    /// Number of segments the scan yields, counting a non-blank tail.
    fn segment_count(&self) -> usize {
        self.closed.len() + usize::from(!self.tail_is_blank())
    }
}

fn scan<'a>(text: &'a str, punctuation: &PunctuationSet) -> Scan<'a> {
    let mut closed = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if punctuation.contains(c) {
            let end = i + c.len_utf8();
            let candidate = text[start..end].trim();
            // Only blank if the punctuation set itself contains whitespace.
            if !candidate.is_empty() {
                closed.push(candidate.to_owned());
            }
            start = end;
        }
    }
    Scan {
        closed,
        tail: &text[start..],
    }
}

/// Split `text` into trimmed, non-empty segments, keeping each punctuation
/// mark attached to the text before it. A trailing segment without
/// punctuation is included.
#[must_use]
pub fn split_sentences(text: &str, punctuation: &PunctuationSet) -> Vec<String> {
    let scan = scan(text, punctuation);
    let mut segments = scan.closed;
    let tail = scan.tail.trim();
    if !tail.is_empty() {
        segments.push(tail.to_owned());
    }
    segments
}

/// Per-speaker streaming segmenter.
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    punctuation: PunctuationSet,
    buffers: HashMap<SpeakerId, String>,
}

impl Segmenter {
    #[must_use]
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            punctuation: PunctuationSet::new(&config.punctuation),
            buffers: HashMap::new(),
        }
    }

    /// Feed one fragment for `speaker`, returning every chunk it completes.
    ///
    /// Streaming fragments emit all finished segments except the newest one,
    /// which stays buffered. A non-streaming or `complete` fragment flushes
    /// the buffer together with its own text and leaves the buffer empty.
    pub fn ingest(
        &mut self,
        speaker: &SpeakerId,
        fragment: &str,
        is_streaming: bool,
        is_complete: bool,
    ) -> Vec<SentenceChunk> {
        if is_streaming && !is_complete {
            self.ingest_streaming(speaker, fragment)
        } else {
            self.flush(speaker, fragment)
        }
    }

    /// [`Self::ingest`] for a decoded [`TextFragment`]. An interrupted
    /// marker discards the speaker's held-back text instead of flushing it.
    pub fn ingest_fragment(
        &mut self,
        speaker: &SpeakerId,
        fragment: &TextFragment,
    ) -> Vec<SentenceChunk> {
        if fragment.interrupted {
            self.discard(speaker);
            return Vec::new();
        }
        self.ingest(speaker, &fragment.text, fragment.streaming, fragment.complete)
    }

    fn ingest_streaming(&mut self, speaker: &SpeakerId, fragment: &str) -> Vec<SentenceChunk> {
        let buffer = self.buffers.entry(speaker.clone()).or_default();
        buffer.push_str(fragment);

        let scan = scan(buffer, &self.punctuation);
        if scan.segment_count() <= 1 {
            return Vec::new();
        }

        let (emit, retained) = if scan.tail_is_blank() {
            // The newest closed segment stays buffered until more arrives.
            let mut closed = scan.closed;
            let last = closed.pop().unwrap_or_default();
            (closed, last)
        } else {
            let tail = scan.tail.to_owned();
            (scan.closed, tail)
        };
        *buffer = retained;

        emit.into_iter()
            .map(|text| SentenceChunk {
                speaker: speaker.clone(),
                text,
                is_final: false,
            })
            .collect()
    }

    fn flush(&mut self, speaker: &SpeakerId, fragment: &str) -> Vec<SentenceChunk> {
        let mut remaining = self.buffers.remove(speaker).unwrap_or_default();
        remaining.push_str(fragment);
        split_sentences(&remaining, &self.punctuation)
            .into_iter()
            .map(|text| SentenceChunk {
                speaker: speaker.clone(),
                text,
                is_final: true,
            })
            .collect()
    }

    /// Text currently held back for `speaker`.
    #[must_use]
    pub fn pending(&self, speaker: &SpeakerId) -> &str {
        self.buffers.get(speaker).map_or("", String::as_str)
    }

    /// Drop the text held back for one speaker.
    pub fn discard(&mut self, speaker: &SpeakerId) {
        if let Some(dropped) = self.buffers.remove(speaker).filter(|b| !b.is_empty()) {
            debug!(%speaker, "discarding interrupted text: {dropped}");
        }
    }

    /// Discard every speaker's buffered text.
    pub fn reset(&mut self) {
        self.buffers.clear();
    }
}

/// Segmenter node: one input port per speaker, one `text_segment_<id>`
/// output port per speaker.
pub struct SegmenterNode {
    speakers: Vec<SpeakerId>,
    segmenter: Segmenter,
}

impl SegmenterNode {
    #[must_use]
    pub fn new(speakers: Vec<SpeakerId>, config: &SegmenterConfig) -> Self {
        Self {
            speakers,
            segmenter: Segmenter::new(config),
        }
    }

    fn speaker_for_port(&self, port: &str) -> Option<&SpeakerId> {
        self.speakers.iter().find(|s| s.as_str() == port)
    }

    fn handle_input(&mut self, input: &InputEvent, outputs: &OutputSender) {
        if let Some(speaker) = self.speaker_for_port(&input.id).cloned() {
            let fragment = TextFragment::from_input(input, outputs.node_name());
            let port = speaker.segment_port();
            for chunk in self.segmenter.ingest_fragment(&speaker, &fragment) {
                debug!(%speaker, final_chunk = chunk.is_final, "segment: {}", chunk.text);
                log_send_error(outputs, outputs.send_text(&port, chunk.text));
            }
            log_send_error(
                outputs,
                outputs.send_status(serde_json::json!({
                    "status": "processed",
                    "source": speaker.as_str(),
                })),
            );
            return;
        }

        match input.id.as_str() {
            "audio_complete" => {
                info!("audio playback complete");
                log_send_error(
                    outputs,
                    outputs.send_status(serde_json::json!({"status": "audio_complete"})),
                );
            }
            "audio_buffer_control" => {
                info!("audio buffer control: {}", input.text_or_empty(NODE_TAG));
            }
            "control" | "reset" => {
                let raw = input.text_or_empty(NODE_TAG);
                info!("control signal: {raw}");
                if ControlCommand::parse(&raw) == Some(ControlCommand::Reset) {
                    self.segmenter.reset();
                    info!("buffers reset");
                }
            }
            other => debug!(port = other, "ignoring input on unknown port"),
        }
    }
}

#[async_trait]
impl Node for SegmenterNode {
    fn name(&self) -> &str {
        "segmenter"
    }

    async fn run(mut self: Box<Self>, mut io: NodeIo) -> Result<()> {
        info!(speakers = ?self.speakers, "starting text segmenter");
        while let Some(event) = io.recv().await {
            match event {
                NodeEvent::Input(input) => {
                    debug!(port = %input.id, "segmenter input");
                    self.handle_input(&input, io.outputs());
                }
                NodeEvent::Stop => {
                    info!("segmenter stopping");
                    break;
                }
                NodeEvent::Error(e) => warn!("upstream error: {e}"),
            }
        }
        crate::node::send_shutdown_log(io.outputs(), NODE_TAG);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::node::{Metadata, PortValue, node_channel};

    fn texts(chunks: &[SentenceChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    fn speaker() -> SpeakerId {
        SpeakerId::from("techer")
    }

    #[test]
    fn split_keeps_punctuation_with_preceding_text() {
        let set = PunctuationSet::default();
        assert_eq!(
            split_sentences("你好。请问你叫什么？", &set),
            vec!["你好。", "请问你叫什么？"]
        );
    }

    #[test]
    fn split_trims_and_keeps_unterminated_tail() {
        let set = PunctuationSet::default();
        assert_eq!(
            split_sentences("  Hello, world. and more ", &set),
            vec!["Hello,", "world.", "and more"]
        );
    }

    #[test]
    fn split_consecutive_marks_yield_no_empty_segments() {
        let set = PunctuationSet::default();
        let segments = split_sentences("真的吗？！。", &set);
        assert_eq!(segments, vec!["真的吗？", "！", "。"]);
        assert!(segments.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn split_blank_input_is_empty() {
        let set = PunctuationSet::default();
        assert!(split_sentences("", &set).is_empty());
        assert!(split_sentences("   ", &set).is_empty());
    }

    #[test]
    fn non_streaming_fragment_is_split_fully() {
        let mut seg = Segmenter::default();
        let chunks = seg.ingest(&speaker(), "你好。请问你叫什么？", false, false);
        assert_eq!(texts(&chunks), vec!["你好。", "请问你叫什么？"]);
        assert!(chunks.iter().all(|c| c.is_final));
        assert_eq!(seg.pending(&speaker()), "");
    }

    #[test]
    fn streaming_holds_last_segment_until_complete() {
        let mut seg = Segmenter::default();
        let s = speaker();

        assert!(seg.ingest(&s, "你好", true, false).is_empty());

        let second = seg.ingest(&s, "。还有问题吗", true, false);
        assert_eq!(texts(&second), vec!["你好。"]);
        assert!(!second[0].is_final);

        assert!(seg.ingest(&s, "？", true, false).is_empty());
        assert_eq!(seg.pending(&s), "还有问题吗？");

        let last = seg.ingest(&s, "", false, true);
        assert_eq!(texts(&last), vec!["还有问题吗？"]);
        assert!(last[0].is_final);
        assert_eq!(seg.pending(&s), "");
    }

    #[test]
    fn whitespace_fragment_does_not_disturb_buffer() {
        let mut seg = Segmenter::default();
        let s = speaker();
        seg.ingest(&s, "hello", true, false);
        assert!(seg.ingest(&s, "   ", true, false).is_empty());
        seg.ingest(&s, "world", true, false);
        assert_eq!(seg.pending(&s), "hello   world");
    }

    #[test]
    fn punctuation_only_fragments_flush_once_text_arrives() {
        let mut seg = Segmenter::default();
        let s = speaker();
        assert!(seg.ingest(&s, "。", true, false).is_empty());
        let mut emitted = seg.ingest(&s, "。", true, false);
        emitted.extend(seg.ingest(&s, "好", true, false));
        emitted.extend(seg.ingest(&s, "", false, true));
        let joined: String = emitted.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, "。。好");
    }

    #[test]
    fn speakers_have_independent_buffers() {
        let mut seg = Segmenter::default();
        let a = SpeakerId::from("techer");
        let b = SpeakerId::from("myself");
        seg.ingest(&a, "老师", true, false);
        seg.ingest(&b, "学生", true, false);
        let flushed = seg.ingest(&a, "", false, true);
        assert_eq!(texts(&flushed), vec!["老师"]);
        assert_eq!(seg.pending(&b), "学生");
    }

    #[test]
    fn reset_discards_partial_text() {
        let mut seg = Segmenter::default();
        let s = speaker();
        seg.ingest(&s, "unfinished", true, false);
        seg.reset();
        assert_eq!(seg.pending(&s), "");
        assert!(seg.ingest(&s, "", false, true).is_empty());
    }

    #[test]
    fn interrupted_marker_drops_only_that_speakers_tail() {
        let mut seg = Segmenter::default();
        let s = speaker();
        let other = SpeakerId::from("myself");
        let emitted = seg.ingest(&s, "你好。请问", true, false);
        assert_eq!(texts(&emitted), vec!["你好。"]);
        seg.ingest(&other, "学生", true, false);

        assert!(seg.ingest_fragment(&s, &TextFragment::interrupted()).is_empty());
        assert_eq!(seg.pending(&s), "");
        assert_eq!(seg.pending(&other), "学生");

        let next = seg.ingest(&s, "很好。", false, true);
        assert_eq!(texts(&next), vec!["很好。"]);
    }

    #[test]
    fn emitted_chunks_plus_tail_preserve_all_text() {
        let inputs = [
            "同学们好",
            "！今天",
            "我们来讨论",
            "一个有趣的话题。",
            "Hello, ",
            "wor",
            "ld!! Is it",
            " on?",
            "，；",
            "tail",
        ];
        let mut seg = Segmenter::default();
        let s = speaker();
        let mut emitted = String::new();
        for fragment in inputs {
            for chunk in seg.ingest(&s, fragment, true, false) {
                assert!(!chunk.text.is_empty());
                emitted.push_str(&chunk.text);
            }
        }
        emitted.push_str(seg.pending(&s));

        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&emitted), strip(&inputs.concat()));

        let mut flushed = String::new();
        for chunk in seg.ingest(&s, "", false, true) {
            flushed.push_str(&chunk.text);
        }
        assert_eq!(strip(&flushed), strip(seg.pending(&s)) + "tail");
    }

    #[test]
    fn character_stream_matches_whole_message_split() {
        let reply = "我认为这个话题非常有趣。让我分享一下我的观点。";
        let mut seg = Segmenter::default();
        let s = speaker();
        let mut chunks = Vec::new();
        for c in reply.chars() {
            chunks.extend(seg.ingest(&s, &c.to_string(), true, false));
        }
        chunks.extend(seg.ingest(&s, "", false, true));
        assert_eq!(
            texts(&chunks),
            split_sentences(reply, &PunctuationSet::default())
        );
    }

    #[tokio::test]
    async fn node_routes_segments_to_speaker_ports() {
        let node = SegmenterNode::new(
            vec![SpeakerId::from("techer"), SpeakerId::from("myself")],
            &SegmenterConfig::default(),
        );
        let (mut handle, io) = node_channel("segmenter", 16);
        let task = tokio::spawn(Box::new(node).run(io));

        let streaming = Metadata::new().with("streaming", true);
        handle
            .input("myself", "你好。再", streaming.clone())
            .await
            .unwrap();
        handle
            .input("myself", "", Metadata::new().with("complete", true))
            .await
            .unwrap();
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        let mut segments = Vec::new();
        let mut log = None;
        while let Some(out) = handle.try_recv_output() {
            match out.port.as_str() {
                "text_segment_myself" => segments.push(out.value.as_text().unwrap()),
                "log" => log = Some(out.value),
                _ => {}
            }
        }
        assert_eq!(segments, vec!["你好。", "再"]);
        assert_eq!(
            log,
            Some(PortValue::Text("[SEGMENTER] Shutdown complete".to_owned()))
        );
    }

    #[tokio::test]
    async fn node_reset_control_clears_buffers() {
        let node = SegmenterNode::new(vec![SpeakerId::from("techer")], &SegmenterConfig::default());
        let (mut handle, io) = node_channel("segmenter", 16);
        let task = tokio::spawn(Box::new(node).run(io));

        let streaming = Metadata::new().with("streaming", true);
        handle.input("techer", "丢弃", streaming).await.unwrap();
        handle.input("control", "reset", Metadata::new()).await.unwrap();
        handle
            .input("techer", "", Metadata::new().with("complete", true))
            .await
            .unwrap();
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        while let Some(out) = handle.try_recv_output() {
            assert_ne!(out.port, "text_segment_techer");
        }
    }
}

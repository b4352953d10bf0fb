//! Layout model of one chat view.
//!
//! The document is an ordered list of blocks with estimated pixel heights and
//! a viewport over them. It decides where a message goes, whether it shares
//! the previous block's header, and how the scroll offset moves so the
//! content the user is reading stays put.

use std::ops::Range;

use harmony_core::{config::DisplayConfig, ChatMessage, Millis, Severity};
use ruma::{EventId, OwnedEventId};

use crate::markdown::escape_html;

/// Visible window over the document, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewport {
    pub offset: u32,
    pub page: u32,
}

/// HTML of one block as handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBlock {
    pub html: String,
    pub height: u32,
}

/// Result of an insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Insertion {
    pub index: usize,
    pub block: RenderedBlock,
    pub regrouped: Option<(usize, RenderedBlock)>,
    pub viewport: Viewport,
}

#[derive(Debug, Clone)]
enum Content {
    Message {
        message: ChatMessage,
        sender_name: String,
    },
    System {
        text: String,
        severity: Severity,
    },
}

#[derive(Debug, Clone)]
struct Block {
    content: Content,
    show_header: bool,
    separated: bool,
    confirmed: bool,
    height: u32,
}

impl Block {
    fn message(&self) -> Option<&ChatMessage> {
        match &self.content {
            Content::Message { message, .. } => Some(message),
            Content::System { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    group_window: Millis,
    separation: Millis,
    pin_tolerance: u32,
    line_height: u32,
    header_height: u32,
    separator_height: u32,
    chars_per_line: usize,
}

impl From<&DisplayConfig> for Layout {
    fn from(config: &DisplayConfig) -> Self {
        let secs = |s: u64| Millis::try_from(s.saturating_mul(1000)).unwrap_or(Millis::MAX);
        Self {
            group_window: secs(config.group_window_secs),
            separation: secs(config.separation_secs),
            pin_tolerance: config.pin_tolerance_px,
            line_height: config.line_height_px,
            header_height: config.header_height_px,
            separator_height: config.separator_height_px,
            chars_per_line: config.chars_per_line.max(1),
        }
    }
}

impl Layout {
    fn text_lines(&self, text: &str) -> u32 {
        let lines: usize = text
            .lines()
            .map(|line| line.chars().count().div_ceil(self.chars_per_line).max(1))
            .sum();
        u32::try_from(lines.max(1)).unwrap_or(u32::MAX)
    }

    fn height(&self, block: &Block) -> u32 {
        let text = match &block.content {
            Content::Message { message, .. } => message.body.as_str(),
            Content::System { text, .. } => text.as_str(),
        };
        let mut height = self.text_lines(text).saturating_mul(self.line_height);
        if block.show_header {
            height = height.saturating_add(self.header_height);
        }
        if block.separated {
            height = height.saturating_add(self.separator_height);
        }
        height
    }
}

fn sort_key(message: &ChatMessage) -> (Millis, &str) {
    (
        message.timestamp,
        message.event_id.as_ref().map(|id| id.as_str()).unwrap_or_default(),
    )
}

fn render(block: &Block) -> String {
    let separator = if block.separated {
        "<hr class=\"separator\"/>"
    } else {
        ""
    };
    match &block.content {
        Content::Message { message, sender_name } => {
            let header = if block.show_header {
                format!(
                    "<div class=\"header\"><span class=\"sender\">{}</span> <span class=\"time\">{}</span></div>",
                    escape_html(sender_name),
                    message.time_label()
                )
            } else {
                String::new()
            };
            let pending = if block.confirmed { "" } else { " pending" };
            format!(
                "{separator}<div class=\"{}{pending}\">{header}<div class=\"body\">{}</div></div>",
                message.html_class(),
                message.html
            )
        }
        Content::System { text, severity } => {
            format!("{separator}<div class=\"system {severity}\">{}</div>", escape_html(text))
        }
    }
}

/// Ordered blocks of one chat view plus its viewport.
#[derive(Debug)]
pub struct MessageDocument {
    layout: Layout,
    /// Messages older than this are history and sorted into place
    start: Millis,
    blocks: Vec<Block>,
    viewport: Viewport,
}

impl MessageDocument {
    pub fn new(config: &DisplayConfig, start: Millis, page: u32) -> Self {
        Self {
            layout: Layout::from(config),
            start,
            blocks: Vec::new(),
            viewport: Viewport { offset: 0, page },
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn total_height(&self) -> u32 {
        self.blocks.iter().map(|b| b.height).fold(0, u32::saturating_add)
    }

    fn max_offset(&self) -> u32 {
        self.total_height().saturating_sub(self.viewport.page)
    }

    pub fn distance_from_bottom(&self) -> u32 {
        self.max_offset().saturating_sub(self.viewport.offset)
    }

    pub fn at_top(&self) -> bool {
        self.viewport.offset == 0
    }

    /// All content is visible without scrolling.
    pub fn content_fits(&self) -> bool {
        self.total_height() <= self.viewport.page
    }

    fn is_pinned(&self) -> bool {
        self.distance_from_bottom() <= self.layout.pin_tolerance
    }

    fn top_of(&self, index: usize) -> u32 {
        self.blocks[..index]
            .iter()
            .map(|b| b.height)
            .fold(0, u32::saturating_add)
    }

    /// Where `message` belongs. History is placed among the messages by
    /// (timestamp, event id); live messages go to the end unless they
    /// overtook a message already rendered.
    fn insertion_index(&self, message: &ChatMessage) -> usize {
        let key = sort_key(message);
        if message.timestamp < self.start {
            return self
                .blocks
                .iter()
                .position(|b| b.message().is_some_and(|m| sort_key(m) > key))
                .unwrap_or(self.blocks.len());
        }

        let mut index = self.blocks.len();
        while index > 0 {
            match self.blocks[index - 1].message() {
                Some(previous) if sort_key(previous) > key => index -= 1,
                _ => break,
            }
        }
        index
    }

    /// Recompute header and separator of the block at `index` from its
    /// predecessor. Returns true if either changed.
    fn regroup(&mut self, index: usize) -> bool {
        let previous = index.checked_sub(1).map(|i| &self.blocks[i]);
        let Some(message) = self.blocks[index].message() else {
            return false;
        };

        let (show_header, separated) = match previous.and_then(Block::message) {
            Some(prev) => {
                let gap = message.timestamp - prev.timestamp;
                let same_sender = prev.sender == message.sender;
                (
                    !(same_sender && (0..=self.layout.group_window).contains(&gap)),
                    gap > self.layout.separation,
                )
            }
            // First block, or right after a system message
            None => (true, false),
        };

        let block = &mut self.blocks[index];
        if block.show_header == show_header && block.separated == separated {
            return false;
        }
        block.show_header = show_header;
        block.separated = separated;
        block.height = self.layout.height(block);
        true
    }

    fn rendered(&self, index: usize) -> RenderedBlock {
        let block = &self.blocks[index];
        RenderedBlock {
            html: render(block),
            height: block.height,
        }
    }

    fn insert_block(&mut self, index: usize, block: Block) -> Insertion {
        let at_end = index == self.blocks.len();
        let was_pinned = self.is_pinned();
        let y = self.top_of(index);
        let before = self.total_height();

        self.blocks.insert(index, block);
        self.regroup(index);
        let height = self.layout.height(&self.blocks[index]);
        self.blocks[index].height = height;

        let next = index + 1;
        let regrouped = (next < self.blocks.len() && self.regroup(next)).then(|| (next, self.rendered(next)));

        let delta = self.total_height().saturating_sub(before);
        if at_end {
            if was_pinned {
                self.viewport.offset = self.max_offset();
            }
        } else if y <= self.viewport.offset {
            self.viewport.offset = self.viewport.offset.saturating_add(delta);
        }
        self.viewport.offset = self.viewport.offset.min(self.max_offset());

        Insertion {
            index,
            block: self.rendered(index),
            regrouped,
            viewport: self.viewport,
        }
    }

    /// Insert a message. `sender_name` is shown in the header.
    pub fn insert_message(&mut self, message: ChatMessage, sender_name: &str) -> Insertion {
        let index = self.insertion_index(&message);
        let confirmed = message.event_id.is_some();
        self.insert_block(
            index,
            Block {
                content: Content::Message {
                    message,
                    sender_name: sender_name.to_owned(),
                },
                show_header: true,
                separated: false,
                confirmed,
                height: 0,
            },
        )
    }

    /// Append an informational block at the current end.
    pub fn append_system(&mut self, text: &str, severity: Severity) -> Insertion {
        let index = self.blocks.len();
        self.insert_block(
            index,
            Block {
                content: Content::System {
                    text: text.to_owned(),
                    severity,
                },
                show_header: false,
                separated: false,
                confirmed: true,
                height: 0,
            },
        )
    }

    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.blocks
            .iter()
            .any(|b| b.message().and_then(|m| m.event_id.as_deref()) == Some(event_id))
    }

    /// Attach the server event id to the local echo sent with `txn_id`.
    pub fn confirm_echo(&mut self, txn_id: &str, event_id: OwnedEventId) -> Option<usize> {
        let index = self.blocks.iter().position(|b| {
            !b.confirmed && b.message().and_then(|m| m.transaction_id.as_deref()) == Some(txn_id)
        })?;
        let block = &mut self.blocks[index];
        if let Content::Message { message, .. } = &mut block.content {
            message.event_id = Some(event_id);
        }
        block.confirmed = true;
        Some(index)
    }

    pub fn scroll_to(&mut self, offset: u32) -> Viewport {
        self.viewport.offset = offset.min(self.max_offset());
        self.viewport
    }

    /// Change the page height, keeping the distance from the bottom.
    pub fn resize(&mut self, page: u32) -> Viewport {
        let distance = self.distance_from_bottom();
        self.viewport.page = page;
        self.viewport.offset = self.max_offset().saturating_sub(distance);
        self.viewport
    }

    /// Index ranges of blocks that render as one visual group.
    pub fn groups(&self) -> Vec<Range<usize>> {
        let mut groups: Vec<Range<usize>> = Vec::new();
        for (index, block) in self.blocks.iter().enumerate() {
            match groups.last_mut() {
                Some(group) if !block.show_header && block.message().is_some() => group.end = index + 1,
                _ => groups.push(index..index + 1),
            }
        }
        groups
    }

    pub fn is_separated(&self, index: usize) -> bool {
        self.blocks.get(index).is_some_and(|b| b.separated)
    }

    pub fn shows_header(&self, index: usize) -> bool {
        self.blocks.get(index).is_some_and(|b| b.show_header)
    }

    /// Event ids of the rendered messages, in document order.
    pub fn event_ids(&self) -> Vec<Option<String>> {
        self.blocks
            .iter()
            .filter_map(Block::message)
            .map(|m| m.event_id.as_ref().map(|id| id.to_string()))
            .collect()
    }

    pub fn html(&self, index: usize) -> Option<String> {
        self.blocks.get(index).map(render)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_core::MessageOrigin;
    use ruma::{room_id, EventId, UserId};
    use test_log::test;

    const MINUTE: Millis = 60_000;
    const START: Millis = 1_000 * MINUTE;

    fn config() -> DisplayConfig {
        DisplayConfig {
            line_height_px: 10,
            header_height_px: 5,
            separator_height_px: 3,
            pin_tolerance_px: 4,
            ..DisplayConfig::default()
        }
    }

    fn message(id: &str, sender: &str, timestamp: Millis) -> ChatMessage {
        ChatMessage {
            event_id: Some(EventId::parse(id).unwrap()),
            sender: UserId::parse(sender).unwrap(),
            room_id: room_id!("!r:example.org").to_owned(),
            receiver: UserId::parse("@me:example.org").unwrap(),
            html: format!("<p>{id}</p>"),
            body: id.to_owned(),
            timestamp,
            origin: MessageOrigin::Live,
            transaction_id: None,
        }
    }

    #[test]
    fn close_messages_share_a_header() {
        let mut doc = MessageDocument::new(&config(), START, 100);
        doc.insert_message(message("$1", "@ann:example.org", START), "Ann");
        doc.insert_message(message("$2", "@ann:example.org", START + MINUTE), "Ann");

        assert_eq!(doc.groups(), vec![0..2]);
        assert!(!doc.shows_header(1));
        assert!(!doc.is_separated(1));
        assert!(!doc.html(1).unwrap().contains("class=\"header\""));
    }

    #[test]
    fn long_gap_starts_a_separated_group() {
        let mut doc = MessageDocument::new(&config(), START, 100);
        doc.insert_message(message("$1", "@ann:example.org", START), "Ann");
        doc.insert_message(message("$2", "@ann:example.org", START + 20 * MINUTE), "Ann");

        assert_eq!(doc.groups(), vec![0..1, 1..2]);
        assert!(doc.shows_header(1));
        assert!(doc.is_separated(1));
        assert!(doc.html(1).unwrap().starts_with("<hr class=\"separator\"/>"));
    }

    #[test]
    fn history_is_sorted_in_and_regroups_the_next_block() {
        let mut doc = MessageDocument::new(&config(), START, 100);
        doc.insert_message(message("$3", "@ann:example.org", START + MINUTE), "Ann");
        // Backfill arrives newest first
        doc.insert_message(message("$2", "@ann:example.org", START - MINUTE), "Ann");
        let insertion = doc.insert_message(message("$1", "@bob:example.org", START - 2 * MINUTE), "Bob");

        assert_eq!(insertion.index, 0);
        assert_eq!(
            doc.event_ids(),
            vec![Some("$1".into()), Some("$2".into()), Some("$3".into())]
        );
        // $2 keeps its header: its predecessor is now Bob
        assert!(doc.shows_header(1));
        assert!(!doc.shows_header(2));
    }

    #[test]
    fn inserting_above_the_viewport_keeps_content_in_place() {
        let mut doc = MessageDocument::new(&config(), START, 20);
        for i in 0..5 {
            doc.insert_message(message(&format!("$l{i}"), &format!("@u{i}:example.org"), START + i), "U");
        }
        // Each block: 10 line + 5 header
        assert_eq!(doc.total_height(), 75);
        doc.scroll_to(30);

        let insertion = doc.insert_message(message("$h", "@old:example.org", START - MINUTE), "Old");
        assert_eq!(insertion.index, 0);
        assert_eq!(insertion.viewport.offset, 45);
    }

    #[test]
    fn bottom_insert_repins_only_when_pinned() {
        let mut doc = MessageDocument::new(&config(), START, 20);
        for i in 0..4 {
            doc.insert_message(message(&format!("$a{i}"), &format!("@u{i}:example.org"), START + i), "U");
        }
        assert_eq!(doc.distance_from_bottom(), 0);

        doc.insert_message(message("$b", "@x:example.org", START + 10), "X");
        assert_eq!(doc.distance_from_bottom(), 0);

        doc.scroll_to(0);
        let before = doc.viewport();
        doc.insert_message(message("$c", "@y:example.org", START + 11), "Y");
        assert_eq!(doc.viewport(), before);
    }

    #[test]
    fn resize_keeps_distance_from_bottom() {
        let mut doc = MessageDocument::new(&config(), START, 20);
        for i in 0..6 {
            doc.insert_message(message(&format!("$a{i}"), &format!("@u{i}:example.org"), START + i), "U");
        }
        doc.scroll_to(40);
        let distance = doc.distance_from_bottom();
        doc.resize(30);
        assert_eq!(doc.distance_from_bottom(), distance);
    }

    #[test]
    fn system_messages_go_to_the_end_and_break_groups() {
        let mut doc = MessageDocument::new(&config(), START, 100);
        doc.insert_message(message("$1", "@ann:example.org", START), "Ann");
        let insertion = doc.append_system("Command not found", Severity::Error);
        assert_eq!(insertion.index, 1);
        assert!(insertion.block.html.contains("system error"));

        doc.insert_message(message("$2", "@ann:example.org", START + 1), "Ann");
        assert!(doc.shows_header(2));
        assert_eq!(doc.groups().len(), 3);
    }

    #[test]
    fn echo_confirmation_attaches_event_id() {
        let mut doc = MessageDocument::new(&config(), START, 100);
        let mut echo = message("$unused", "@me:example.org", START);
        echo.event_id = None;
        echo.transaction_id = Some("txn1".into());
        let insertion = doc.insert_message(echo, "Me");
        assert!(insertion.block.html.contains("own-message pending"));

        let index = doc.confirm_echo("txn1", EventId::parse("$srv").unwrap());
        assert_eq!(index, Some(0));
        assert_eq!(doc.event_ids(), vec![Some("$srv".into())]);
        assert_eq!(doc.confirm_echo("txn1", EventId::parse("$srv").unwrap()), None);
        assert!(doc.contains_event(&EventId::parse("$srv").unwrap()));
        assert!(!doc.contains_event(&EventId::parse("$unused").unwrap()));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message and tool-name sanitisation at the wire boundary.

use crate::types::{ContentPart, Message};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Replace image and binary content in `messages` with a text placeholder
/// when the target model does not support image input.  No-op otherwise.
pub fn strip_images_if_unsupported(messages: Vec<Message>, supports_images: bool) -> Vec<Message> {
    if supports_images {
        return messages;
    }
    messages
        .into_iter()
        .map(|mut m| {
            for part in m.parts.iter_mut() {
                match part {
                    ContentPart::ImageUrl { .. } | ContentPart::Binary { .. } => {
                        *part = ContentPart::text(IMAGE_OMITTED);
                    }
                    ContentPart::ToolResult { data, mime_type, .. } => {
                        *data = None;
                        *mime_type = None;
                    }
                    _ => {}
                }
            }
            m
        })
        .collect()
}

/// Sanitise a tool name arriving from the model before registry lookup.
///
/// Some models append stray markup to the function name (`grep</tool_call>`,
/// `view{"path"...`).  Everything from the first XML/JSON-looking character
/// onward is dropped, then any remaining characters outside `[A-Za-z0-9_-]`.
pub fn sanitize_tool_name(name: &str) -> String {
    let cut = name
        .find(|c| matches!(c, '<' | '>' | '{' | '}' | '[' | ']' | '(' | '"'))
        .unwrap_or(name.len());
    name[..cut]
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_when_images_supported() {
        let msg = Message::user_with_parts(
            "s1",
            vec![ContentPart::text("hi"), ContentPart::image("data:image/png;base64,A")],
        );
        let out = strip_images_if_unsupported(vec![msg], true);
        assert_eq!(out[0].image_urls().len(), 1);
    }

    #[test]
    fn strips_image_parts_for_text_only_models() {
        let msg = Message::user_with_parts(
            "s1",
            vec![ContentPart::text("describe"), ContentPart::image("data:image/png;base64,A")],
        );
        let out = strip_images_if_unsupported(vec![msg], false);
        assert!(out[0].image_urls().is_empty());
        assert!(out[0].text().contains(IMAGE_OMITTED));
    }

    #[test]
    fn strips_binary_tool_result_payloads() {
        let mut msg = Message::tool_result("s1", "call_1", "screenshot taken");
        if let Some(ContentPart::ToolResult { data, mime_type, .. }) = msg.parts.first_mut() {
            *data = Some("AAAA".into());
            *mime_type = Some("image/png".into());
        }
        let out = strip_images_if_unsupported(vec![msg], false);
        match &out[0].parts[0] {
            ContentPart::ToolResult { data, mime_type, content, .. } => {
                assert!(data.is_none());
                assert!(mime_type.is_none());
                assert_eq!(content, "screenshot taken");
            }
            other => panic!("wrong part: {other:?}"),
        }
    }

    #[test]
    fn plain_text_messages_pass_through_unchanged() {
        let out = strip_images_if_unsupported(vec![Message::user("s1", "hello")], false);
        assert_eq!(out[0].text(), "hello");
    }

    // ── sanitize_tool_name ────────────────────────────────────────────────────

    #[test]
    fn clean_names_pass_through() {
        assert_eq!(sanitize_tool_name("multi-edit"), "multi-edit");
        assert_eq!(sanitize_tool_name("job_output"), "job_output");
    }

    #[test]
    fn trailing_xml_fragment_stripped() {
        assert_eq!(sanitize_tool_name("grep</tool_call>"), "grep");
        assert_eq!(sanitize_tool_name("view<|end|>"), "view");
    }

    #[test]
    fn trailing_json_fragment_stripped() {
        assert_eq!(sanitize_tool_name("bash{\"command\":\"ls\"}"), "bash");
        assert_eq!(sanitize_tool_name("edit[0]"), "edit");
    }

    #[test]
    fn interior_punctuation_filtered() {
        assert_eq!(sanitize_tool_name("fetch.url"), "fetchurl");
        assert_eq!(sanitize_tool_name("  ls "), "ls");
    }

    #[test]
    fn empty_name_survives() {
        assert_eq!(sanitize_tool_name(""), "");
    }
}

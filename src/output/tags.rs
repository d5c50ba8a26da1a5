//! Stream tag merging and sanitization
//!
//! Tags are cumulative over a stream: every update is merged into the set
//! already collected, with collisions resolved to the newly received value.
//! taginject does not accept a serialized tag list directly, so the merged
//! set is rendered into `key=value` pairs, with strings quoted and datetimes
//! in ISO-8601.

use crate::media::PipelineError;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use log::warn;

/// Merge a newly received tag list string into the collected one. Every old
/// tag survives; tags present in both take the new value.
pub fn merge_tags(old: Option<&str>, new: &str) -> Result<String, PipelineError> {
    let new_list = parse(new)?;
    let merged = match old {
        Some(old) => {
            let old_list = parse(old)?;
            new_list.merge(&old_list, gst::TagMergeMode::Keep)
        }
        None => new_list,
    };
    Ok(merged.to_string())
}

/// Render a serialized tag list into the string taginject accepts, plus the
/// bitrate value when the list carries one (the encoder property follows it).
pub fn sanitize_for_injection(tags: &str) -> Result<(String, Option<u32>), PipelineError> {
    let list = parse(tags)?;
    let mut parts = Vec::new();
    let mut bitrate = None;
    for index in 0..list.n_tags() {
        let Some(name) = list.nth_tag_name(index as u32) else {
            continue;
        };
        let name: &str = name.as_ref();
        if list.size_by_name(name) > 1 {
            warn!("Some values will be lost for tag: {}", name);
        }
        let Some(value) = list.index_generic(name, 0) else {
            continue;
        };
        let Some(rendered) = render_scalar(value) else {
            warn!("Skipping tag {} with an unsupported value type", name);
            continue;
        };
        if name == "bitrate" {
            if let Ok(value) = value.get::<u32>() {
                bitrate = Some(value);
            }
        }
        parts.push(format!("{}={}", name, rendered));
    }
    Ok((parts.join(","), bitrate))
}

fn parse(tags: &str) -> Result<gst::TagList, PipelineError> {
    tags.parse::<gst::TagList>()
        .map_err(|_| PipelineError::Caps(format!("unparseable tag list: {}", tags)))
}

fn render_scalar(value: &glib::SendValue) -> Option<String> {
    if let Ok(datetime) = value.get::<gst::DateTime>() {
        return datetime.to_iso8601_string().ok().map(|s| format!("\"{}\"", s));
    }
    if let Ok(text) = value.get::<String>() {
        return Some(format!("\"{}\"", text.replace('"', "\\\"")));
    }
    if let Ok(v) = value.get::<u32>() {
        return Some(v.to_string());
    }
    if let Ok(v) = value.get::<u64>() {
        return Some(v.to_string());
    }
    if let Ok(v) = value.get::<i32>() {
        return Some(v.to_string());
    }
    if let Ok(v) = value.get::<i64>() {
        return Some(v.to_string());
    }
    if let Ok(v) = value.get::<f64>() {
        return Some(v.to_string());
    }
    if let Ok(v) = value.get::<bool>() {
        return Some(v.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{merge_tags, sanitize_for_injection};
    use gstreamer as gst;

    fn init() {
        gst::init().unwrap();
    }

    #[test]
    fn merge_keeps_old_tags_and_prefers_new_values() {
        init();
        let old = "taglist, title=(string)old, artist=(string)someone;";
        let new = "taglist, title=(string)new;";
        let merged = merge_tags(Some(old), new).unwrap();
        let (rendered, _) = sanitize_for_injection(&merged).unwrap();
        assert!(rendered.contains("title=\"new\""), "rendered: {}", rendered);
        assert!(rendered.contains("artist=\"someone\""), "rendered: {}", rendered);
    }

    #[test]
    fn merge_without_previous_tags_is_identity() {
        init();
        let merged = merge_tags(None, "taglist, title=(string)clip;").unwrap();
        let (rendered, _) = sanitize_for_injection(&merged).unwrap();
        assert_eq!(rendered, "title=\"clip\"");
    }

    #[test]
    fn bitrate_is_extracted_for_the_encoder() {
        init();
        let (rendered, bitrate) =
            sanitize_for_injection("taglist, title=(string)clip, bitrate=(uint)128000;").unwrap();
        assert!(rendered.contains("bitrate=128000"), "rendered: {}", rendered);
        assert_eq!(bitrate, Some(128000));
    }

    #[test]
    fn datetime_is_rendered_as_iso8601() {
        init();
        let datetime = gst::DateTime::from_iso8601_string("2023-01-15T10:30:00Z").unwrap();
        let mut list = gst::TagList::new();
        list.get_mut()
            .unwrap()
            .add::<gst::tags::DateTime>(&datetime, gst::TagMergeMode::Append);
        let (rendered, _) = sanitize_for_injection(&list.to_string()).unwrap();
        assert!(rendered.starts_with("datetime=\"2023-01-15T10:30:00"), "rendered: {}", rendered);
    }

    #[test]
    fn garbage_tag_lists_are_rejected() {
        init();
        assert!(merge_tags(None, "not a tag list at all").is_err());
    }
}

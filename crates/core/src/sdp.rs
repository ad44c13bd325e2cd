//! Minimal session description rewriting
//!
//! Only the line-level edits negotiation needs: forcing the direction of
//! local media lines and tagging lines with application labels. Codec
//! manipulation lives with the media engine.

use crate::models::{Direction, TrackLabel};

const MID_PREFIX: &str = "a=mid:";
const LABEL_PREFIX: &str = "a=label:";

/// A parsed description: session header lines followed by media sections
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sections {
    eol: &'static str,
    session: Vec<String>,
    media: Vec<Vec<String>>,
    trailing_eol: bool,
}

impl Sections {
    fn parse(sdp: &str) -> Self {
        let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_eol = sdp.ends_with(eol);
        let mut session = Vec::new();
        let mut media: Vec<Vec<String>> = Vec::new();
        for line in sdp.split(eol).filter(|l| !l.is_empty()) {
            if line.starts_with("m=") {
                media.push(vec![line.to_string()]);
            } else if let Some(section) = media.last_mut() {
                section.push(line.to_string());
            } else {
                session.push(line.to_string());
            }
        }
        Self {
            eol,
            session,
            media,
            trailing_eol,
        }
    }

    fn render(&self) -> String {
        let mut lines: Vec<&str> = self.session.iter().map(String::as_str).collect();
        for section in &self.media {
            lines.extend(section.iter().map(String::as_str));
        }
        let mut out = lines.join(self.eol);
        if self.trailing_eol {
            out.push_str(self.eol);
        }
        out
    }
}

fn section_mid(section: &[String]) -> Option<&str> {
    section.iter().find_map(|l| l.strip_prefix(MID_PREFIX))
}

/// Rewrite every `a=sendrecv` media line to `a=sendonly`.
///
/// The SFU never receives on a line it forwards to us, so lines offered as
/// send-and-receive are narrowed. Receive-only and inactive lines are kept.
pub fn force_send_only(sdp: &str) -> String {
    let mut sections = Sections::parse(sdp);
    let from = format!("a={}", Direction::SendRecv.as_attr());
    let to = format!("a={}", Direction::SendOnly.as_attr());
    for section in &mut sections.media {
        for line in section.iter_mut() {
            if *line == from {
                line.clone_from(&to);
            }
        }
    }
    sections.render()
}

/// Attach `a=label:` lines to the media sections named by `labels`.
///
/// An existing label on a section is replaced. Labels for unknown mids are
/// ignored.
pub fn annotate_labels(sdp: &str, labels: &[TrackLabel]) -> String {
    if labels.is_empty() {
        return sdp.to_string();
    }
    let mut sections = Sections::parse(sdp);
    for section in &mut sections.media {
        let Some(mid) = section_mid(section).map(str::to_string) else {
            continue;
        };
        let Some(label) = labels.iter().find(|l| l.mid == mid) else {
            continue;
        };
        section.retain(|l| !l.starts_with(LABEL_PREFIX));
        section.push(format!("{}{}", LABEL_PREFIX, label.label));
    }
    sections.render()
}

/// Media ids of all sections, in order
pub fn media_ids(sdp: &str) -> Vec<String> {
    Sections::parse(sdp)
        .media
        .iter()
        .filter_map(|s| section_mid(s).map(str::to_string))
        .collect()
}

/// Direction attribute of the section with `mid`, if present
pub fn direction_of(sdp: &str, mid: &str) -> Option<Direction> {
    let sections = Sections::parse(sdp);
    let section = sections
        .media
        .iter()
        .find(|s| section_mid(s) == Some(mid))?;
    section.iter().find_map(|line| {
        [
            Direction::SendRecv,
            Direction::SendOnly,
            Direction::RecvOnly,
            Direction::Inactive,
        ]
        .into_iter()
        .find(|d| line.strip_prefix("a=") == Some(d.as_attr()))
    })
}

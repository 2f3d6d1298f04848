//! Rewrites locally generated session descriptions before they are applied
//! and sent. Every pass is pure and leaves already-rewritten text unchanged.

use crate::metadata::MediaSettings;

/// Sending bandwidth caps in kbps per media section kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthCaps {
    pub audio: Option<u32>,
    pub video: Option<u32>,
    pub data: Option<u32>,
}

impl BandwidthCaps {
    fn for_media(&self, media: &str) -> Option<u32> {
        match media {
            "audio" => self.audio,
            "video" => self.video,
            "application" => self.data,
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.data.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpTransform {
    pub strip_video_codec: Option<String>,
    pub stereo: bool,
    pub bandwidth: BandwidthCaps,
}

impl SdpTransform {
    pub fn from_settings(settings: &MediaSettings) -> Self {
        Self {
            strip_video_codec: settings.strip_video_codec.clone(),
            stereo: settings.stereo,
            bandwidth: settings.bandwidth,
        }
    }

    /// Runs codec strip, stereo injection and bandwidth limits in that order.
    /// Stripping first keeps section offsets stable for the later passes.
    pub fn apply(&self, sdp: &str) -> String {
        let mut doc = SdpText::parse(sdp);
        if let Some(codec) = self.strip_video_codec.as_deref() {
            strip_codec_lines(&mut doc.lines, "video", codec);
        }
        if self.stereo {
            inject_opus_stereo(&mut doc.lines);
        }
        if !self.bandwidth.is_empty() {
            inject_bandwidth(&mut doc.lines, &self.bandwidth);
        }
        let rendered = doc.render();
        if rendered != sdp {
            tracing::debug!(
                target = "sdp",
                before_len = sdp.len(),
                after_len = rendered.len(),
                strip = ?self.strip_video_codec,
                stereo = self.stereo,
                "rewrote local description"
            );
        }
        rendered
    }
}

pub fn strip_video_codec(sdp: &str, codec: &str) -> String {
    let mut doc = SdpText::parse(sdp);
    strip_codec_lines(&mut doc.lines, "video", codec);
    doc.render()
}

pub fn enable_stereo(sdp: &str) -> String {
    let mut doc = SdpText::parse(sdp);
    inject_opus_stereo(&mut doc.lines);
    doc.render()
}

pub fn limit_bandwidth(sdp: &str, caps: &BandwidthCaps) -> String {
    let mut doc = SdpText::parse(sdp);
    inject_bandwidth(&mut doc.lines, caps);
    doc.render()
}

struct SdpText {
    lines: Vec<String>,
    eol: &'static str,
    trailing_eol: bool,
}

impl SdpText {
    fn parse(sdp: &str) -> Self {
        let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_eol = sdp.ends_with('\n');
        let lines = sdp
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        Self {
            lines,
            eol,
            trailing_eol,
        }
    }

    fn render(&self) -> String {
        let mut out = self.lines.join(self.eol);
        if self.trailing_eol && !self.lines.is_empty() {
            out.push_str(self.eol);
        }
        out
    }
}

/// Half-open `[start, end)` line ranges of each media section with its kind.
fn media_sections(lines: &[String]) -> Vec<(String, usize, usize)> {
    let starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("m="))
        .map(|(idx, _)| idx)
        .collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(lines.len());
            let media = lines[start][2..]
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            (media, start, end)
        })
        .collect()
}

/// Returns the payload type of an `a=<attr>:<pt> ...` line.
fn attribute_payload<'a>(line: &'a str, attr: &str) -> Option<(&'a str, &'a str)> {
    let rest = line.strip_prefix("a=")?.strip_prefix(attr)?.strip_prefix(':')?;
    let (pt, value) = rest.split_once(' ').unwrap_or((rest, ""));
    Some((pt, value))
}

fn rtpmap_codec(value: &str) -> &str {
    value.split('/').next().unwrap_or_default()
}

fn strip_codec_lines(lines: &mut Vec<String>, media: &str, codec: &str) {
    // walk backwards so removals do not shift sections not yet visited
    for (kind, start, end) in media_sections(lines).into_iter().rev() {
        if kind != media {
            continue;
        }
        let section = &lines[start..end];
        let mut payloads: Vec<String> = section
            .iter()
            .filter_map(|line| attribute_payload(line, "rtpmap"))
            .filter(|(_, value)| rtpmap_codec(value).eq_ignore_ascii_case(codec))
            .map(|(pt, _)| pt.to_string())
            .collect();
        if payloads.is_empty() {
            continue;
        }
        let retransmissions: Vec<String> = section
            .iter()
            .filter_map(|line| attribute_payload(line, "fmtp"))
            .filter(|(_, value)| {
                value
                    .split(';')
                    .filter_map(|param| param.trim().strip_prefix("apt="))
                    .any(|apt| payloads.iter().any(|pt| pt == apt))
            })
            .map(|(pt, _)| pt.to_string())
            .collect();
        payloads.extend(retransmissions);

        let references_payload = |line: &str| {
            ["rtpmap", "fmtp", "rtcp-fb"].iter().any(|attr| {
                attribute_payload(line, attr)
                    .is_some_and(|(pt, _)| payloads.iter().any(|p| p == pt))
            })
        };
        let mut rewritten: Vec<String> = Vec::with_capacity(end - start);
        for line in &lines[start..end] {
            if references_payload(line) {
                continue;
            }
            if line.starts_with("m=") {
                let mut fields = line.split(' ');
                let head: Vec<&str> = fields.by_ref().take(3).collect();
                let formats: Vec<&str> = fields
                    .filter(|pt| !payloads.iter().any(|p| p == pt))
                    .collect();
                let mut parts = head;
                parts.extend(formats);
                rewritten.push(parts.join(" "));
            } else {
                rewritten.push(line.clone());
            }
        }
        tracing::trace!(
            target = "sdp",
            codec,
            removed = ?payloads,
            "stripped codec payloads"
        );
        lines.splice(start..end, rewritten);
    }
}

fn inject_opus_stereo(lines: &mut Vec<String>) {
    for (kind, start, end) in media_sections(lines).into_iter().rev() {
        if kind != "audio" {
            continue;
        }
        let Some((rtpmap_idx, pt)) = lines[start..end].iter().enumerate().find_map(|(i, line)| {
            attribute_payload(line, "rtpmap")
                .filter(|(_, value)| rtpmap_codec(value).eq_ignore_ascii_case("opus"))
                .map(|(pt, _)| (start + i, pt.to_string()))
        }) else {
            continue;
        };
        let fmtp_idx = (start..end).find(|&idx| {
            attribute_payload(&lines[idx], "fmtp").is_some_and(|(fmtp_pt, _)| fmtp_pt == pt)
        });
        match fmtp_idx {
            Some(idx) => {
                let (_, params) = attribute_payload(&lines[idx], "fmtp").unwrap_or_default();
                let mut params: Vec<String> = params
                    .split(';')
                    .map(|param| param.trim().to_string())
                    .filter(|param| !param.is_empty())
                    .collect();
                match params.iter_mut().find(|param| param.starts_with("stereo=")) {
                    Some(param) => *param = "stereo=1".to_string(),
                    None => params.push("stereo=1".to_string()),
                }
                lines[idx] = format!("a=fmtp:{pt} {}", params.join(";"));
            }
            None => lines.insert(rtpmap_idx + 1, format!("a=fmtp:{pt} stereo=1")),
        }
    }
}

fn inject_bandwidth(lines: &mut Vec<String>, caps: &BandwidthCaps) {
    for (kind, start, end) in media_sections(lines).into_iter().rev() {
        let Some(kbps) = caps.for_media(&kind) else {
            continue;
        };
        let mut section: Vec<String> = lines[start..end]
            .iter()
            .filter(|line| !line.starts_with("b=AS:") && !line.starts_with("b=TIAS:"))
            .cloned()
            .collect();
        // bandwidth lines belong after the m=, i= and c= header lines
        let insert_at = section
            .iter()
            .take_while(|line| {
                line.starts_with("m=") || line.starts_with("i=") || line.starts_with("c=")
            })
            .count();
        section.insert(insert_at, format!("b=AS:{kbps}"));
        section.insert(insert_at + 1, format!("b=TIAS:{}", u64::from(kbps) * 1000));
        lines.splice(start..end, section);
    }
}

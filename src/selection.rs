use serde::Serialize;

/// Upper bound on frames in a single flow analysis. The analyze path rejects
/// selections over this bound; the status path truncates for preview only.
pub const MAX_FLOW_FRAMES: usize = 10;

/// A design scene node as the orchestrator sees it: opaque identity, a
/// display name, a mutation version that bumps on every edit, and whether
/// the node can be exported as an image.
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub exportable: bool,
}

/// A raw selection snapshot from the host document.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub name: String,
    pub nodes: Vec<SceneNode>,
}

/// Seam to the host document. Reading the selection is cheap and synchronous;
/// the orchestrator re-reads it on every status sync and analyze call.
pub trait SelectionSource: Send + Sync {
    fn current(&self) -> Selection;
}

/// One exportable frame of a flow. Immutable value object; a fresh set is
/// derived from the selection every time it is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowFrame {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub index: usize,
}

/// Result of normalizing a raw selection: exportable frames in selection
/// order, plus the count of nodes that were dropped for lacking export
/// support (surfaced as a status warning).
#[derive(Debug, Clone, Default)]
pub struct FlowFrames {
    pub frames: Vec<FlowFrame>,
    pub non_exportable: usize,
}

impl FlowFrames {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn over_limit(&self) -> bool {
        self.frames.len() > MAX_FLOW_FRAMES
    }

    /// Preview slice for status display, truncated to the flow bound.
    pub fn preview(&self) -> &[FlowFrame] {
        &self.frames[..self.frames.len().min(MAX_FLOW_FRAMES)]
    }

    pub fn ids(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.id.clone()).collect()
    }
}

/// Normalize a raw selection into ordered flow frames. Non-exportable nodes
/// are counted and skipped; surviving nodes get an ordinal index and a
/// display name falling back to `Frame <n>` when empty or whitespace.
pub fn select_flow_frames(selection: &Selection) -> FlowFrames {
    let mut frames = Vec::new();
    let mut non_exportable = 0usize;

    for node in &selection.nodes {
        if !node.exportable {
            non_exportable += 1;
            continue;
        }
        let index = frames.len();
        let name = if node.name.trim().is_empty() {
            format!("Frame {}", index + 1)
        } else {
            node.name.clone()
        };
        frames.push(FlowFrame {
            id: node.id.clone(),
            name,
            version: node.version,
            index,
        });
    }

    FlowFrames {
        frames,
        non_exportable,
    }
}

/// Deterministic identity of a flow at a point in time. Equality is the
/// cache contract: any frame edit bumps that frame's version and yields a
/// different key.
pub fn flow_key(frames: &[FlowFrame]) -> String {
    frames
        .iter()
        .map(|f| format!("{}:{}", f.id, f.version))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, version: u64, exportable: bool) -> SceneNode {
        SceneNode {
            id: id.to_string(),
            name: name.to_string(),
            version,
            exportable,
        }
    }

    #[test]
    fn filters_non_exportable_and_keeps_order() {
        let selection = Selection {
            name: "Checkout".to_string(),
            nodes: vec![
                node("a", "Start", 1, true),
                node("x", "Sticky note", 1, false),
                node("b", "Payment", 2, true),
            ],
        };
        let flow = select_flow_frames(&selection);
        assert_eq!(flow.len(), 2);
        assert_eq!(flow.non_exportable, 1);
        assert_eq!(flow.frames[0].id, "a");
        assert_eq!(flow.frames[0].index, 0);
        assert_eq!(flow.frames[1].id, "b");
        assert_eq!(flow.frames[1].index, 1);
    }

    #[test]
    fn blank_names_fall_back_to_ordinal() {
        let selection = Selection {
            name: String::new(),
            nodes: vec![node("a", "", 1, true), node("b", "   ", 1, true)],
        };
        let flow = select_flow_frames(&selection);
        assert_eq!(flow.frames[0].name, "Frame 1");
        assert_eq!(flow.frames[1].name, "Frame 2");
    }

    #[test]
    fn flow_key_is_order_and_version_sensitive() {
        let a1 = FlowFrame {
            id: "a".into(),
            name: "A".into(),
            version: 1,
            index: 0,
        };
        let b1 = FlowFrame {
            id: "b".into(),
            name: "B".into(),
            version: 1,
            index: 1,
        };
        let key = flow_key(&[a1.clone(), b1.clone()]);
        assert_eq!(key, "a:1|b:1");

        let mut a2 = a1.clone();
        a2.version = 2;
        assert_ne!(flow_key(&[a2, b1.clone()]), key);
        assert_ne!(flow_key(&[b1, a1]), key);
    }

    #[test]
    fn over_limit_detected_but_preview_truncates() {
        let nodes: Vec<SceneNode> = (0..12)
            .map(|i| node(&format!("n{i}"), "Frame", 1, true))
            .collect();
        let flow = select_flow_frames(&Selection {
            name: "Big".to_string(),
            nodes,
        });
        assert!(flow.over_limit());
        assert_eq!(flow.len(), 12);
        assert_eq!(flow.preview().len(), MAX_FLOW_FRAMES);
    }

    #[test]
    fn empty_selection_yields_empty_flow() {
        let flow = select_flow_frames(&Selection::default());
        assert!(flow.is_empty());
        assert!(!flow.over_limit());
        assert_eq!(flow_key(&flow.frames), "");
    }
}

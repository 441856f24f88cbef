//! Structured animation spec: the contract between the LLM layer and the
//! code synthesizer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub mod validate;

pub use validate::{validate_spec, SpecViolation};

pub const MAX_OBJECTS: usize = 50;
pub const MAX_STEPS: usize = 100;
pub const MAX_PLAYTIME_S: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    #[serde(rename = "2d")]
    TwoD,
    MovingCamera,
    #[serde(rename = "3d")]
    ThreeD,
}

impl SceneKind {
    pub fn scene_base(&self) -> &'static str {
        match self {
            Self::TwoD => "Scene",
            Self::MovingCamera => "MovingCameraScene",
            Self::ThreeD => "ThreeDScene",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaletteColor {
    White,
    Black,
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Teal,
    Pink,
    Gray,
}

impl PaletteColor {
    pub fn token(&self) -> &'static str {
        match self {
            Self::White => "WHITE",
            Self::Black => "BLACK",
            Self::Red => "RED",
            Self::Green => "GREEN",
            Self::Blue => "BLUE",
            Self::Yellow => "YELLOW",
            Self::Orange => "ORANGE",
            Self::Purple => "PURPLE",
            Self::Teal => "TEAL",
            Self::Pink => "PINK",
            Self::Gray => "GRAY",
        }
    }

    pub fn all_tokens() -> &'static [&'static str] {
        &[
            "WHITE", "BLACK", "RED", "GREEN", "BLUE", "YELLOW", "ORANGE", "PURPLE", "TEAL",
            "PINK", "GRAY",
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Text,
    Circle,
    Square,
    Rectangle,
    Triangle,
    Line,
    Arrow,
    Dot,
    VGroup,
    Axes,
    ParametricFunction,
    Polygon,
    RegularPolygon,
}

impl ObjectKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(Self::Text),
            "Circle" => Some(Self::Circle),
            "Square" => Some(Self::Square),
            "Rectangle" => Some(Self::Rectangle),
            "Triangle" => Some(Self::Triangle),
            "Line" => Some(Self::Line),
            "Arrow" => Some(Self::Arrow),
            "Dot" => Some(Self::Dot),
            "VGroup" => Some(Self::VGroup),
            "Axes" => Some(Self::Axes),
            "ParametricFunction" => Some(Self::ParametricFunction),
            "Polygon" => Some(Self::Polygon),
            "RegularPolygon" => Some(Self::RegularPolygon),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Circle => "Circle",
            Self::Square => "Square",
            Self::Rectangle => "Rectangle",
            Self::Triangle => "Triangle",
            Self::Line => "Line",
            Self::Arrow => "Arrow",
            Self::Dot => "Dot",
            Self::VGroup => "VGroup",
            Self::Axes => "Axes",
            Self::ParametricFunction => "ParametricFunction",
            Self::Polygon => "Polygon",
            Self::RegularPolygon => "RegularPolygon",
        }
    }

    pub fn all_tokens() -> &'static [&'static str] {
        &[
            "Text",
            "Circle",
            "Square",
            "Rectangle",
            "Triangle",
            "Line",
            "Arrow",
            "Dot",
            "VGroup",
            "Axes",
            "ParametricFunction",
            "Polygon",
            "RegularPolygon",
        ]
    }

    /// Recognized `params` keys for this kind, beyond the universal
    /// `position`.
    pub fn recognized_params(&self) -> &'static [&'static str] {
        match self {
            Self::Text => &["text", "font_size"],
            Self::Circle => &["radius"],
            Self::Square => &["side_length"],
            Self::Rectangle => &["width", "height"],
            Self::Triangle => &[],
            Self::Line | Self::Arrow => &["start", "end"],
            Self::Dot => &["point", "radius"],
            Self::VGroup => &["of"],
            Self::Axes => &["x_range", "y_range"],
            Self::ParametricFunction => &["curve", "t_min", "t_max", "scale"],
            Self::Polygon => &["points"],
            Self::RegularPolygon => &["n"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Write,
    FadeIn,
    FadeOut,
    Transform,
    ReplacementTransform,
    MoveAlongPath,
    Rotate,
    Scale,
    Shift,
}

impl ActionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Write" => Some(Self::Write),
            "FadeIn" => Some(Self::FadeIn),
            "FadeOut" => Some(Self::FadeOut),
            "Transform" => Some(Self::Transform),
            "ReplacementTransform" => Some(Self::ReplacementTransform),
            "MoveAlongPath" => Some(Self::MoveAlongPath),
            "Rotate" => Some(Self::Rotate),
            "Scale" => Some(Self::Scale),
            "Shift" => Some(Self::Shift),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Write => "Write",
            Self::FadeIn => "FadeIn",
            Self::FadeOut => "FadeOut",
            Self::Transform => "Transform",
            Self::ReplacementTransform => "ReplacementTransform",
            Self::MoveAlongPath => "MoveAlongPath",
            Self::Rotate => "Rotate",
            Self::Scale => "Scale",
            Self::Shift => "Shift",
        }
    }

    pub fn all_tokens() -> &'static [&'static str] {
        &[
            "Create",
            "Write",
            "FadeIn",
            "FadeOut",
            "Transform",
            "ReplacementTransform",
            "MoveAlongPath",
            "Rotate",
            "Scale",
            "Shift",
        ]
    }

    /// Actions that reference a pair of declared objects.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Self::Transform | Self::ReplacementTransform | Self::MoveAlongPath
        )
    }

    pub fn recognized_params(&self) -> &'static [&'static str] {
        match self {
            Self::Rotate => &["angle"],
            Self::Scale => &["factor"],
            Self::Shift => &["by"],
            _ => &[],
        }
    }
}

/// Wire form of the animation spec. `kind` and `action` stay strings here
/// so a corrupted tag survives parsing and is refused downstream instead of
/// being silently dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnimationSpec {
    pub scene_kind: SceneKind,
    pub duration_hint: f64,
    pub background: PaletteColor,
    #[serde(default)]
    pub objects: Vec<ObjectDecl>,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectDecl {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub style: StyleDecl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StyleDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<PaletteColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDecl {
    pub action: String,
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    pub run_time: f64,
    #[serde(default)]
    pub wait_after: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CameraDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
}

impl AnimationSpec {
    /// Total declared playtime across all steps.
    pub fn total_playtime(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| s.run_time + s.wait_after)
            .sum()
    }

    /// Hex SHA-256 of the canonical JSON serialization. Params use ordered
    /// maps, so equal specs hash equally.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

/// Object id shape: `[a-z][a-z0-9_]{0,31}`.
pub fn is_valid_object_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    if id.len() > 32 {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Ids that would collide with language keywords, refused builtins, or
/// the bindings the synthesizer emits itself.
pub fn is_reserved_object_id(id: &str) -> bool {
    matches!(
        id,
        "and"
            | "as"
            | "assert"
            | "async"
            | "await"
            | "break"
            | "class"
            | "continue"
            | "def"
            | "del"
            | "elif"
            | "else"
            | "except"
            | "finally"
            | "for"
            | "from"
            | "global"
            | "if"
            | "import"
            | "in"
            | "is"
            | "lambda"
            | "nonlocal"
            | "not"
            | "or"
            | "pass"
            | "raise"
            | "return"
            | "try"
            | "while"
            | "with"
            | "yield"
            | "exec"
            | "eval"
            | "compile"
            | "open"
            | "input"
            | "print"
            | "len"
            | "range"
            | "type"
            | "id"
            | "object"
            | "super"
            | "os"
            | "sys"
            | "subprocess"
            | "shutil"
            | "socket"
            | "np"
            | "self"
            | "t"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_kind_wire_names() {
        assert_eq!(serde_json::to_string(&SceneKind::TwoD).unwrap(), "\"2d\"");
        assert_eq!(
            serde_json::to_string(&SceneKind::MovingCamera).unwrap(),
            "\"moving_camera\""
        );
        assert_eq!(serde_json::to_string(&SceneKind::ThreeD).unwrap(), "\"3d\"");
    }

    #[test]
    fn object_id_shape() {
        assert!(is_valid_object_id("c"));
        assert!(is_valid_object_id("circle_1"));
        assert!(!is_valid_object_id(""));
        assert!(!is_valid_object_id("Circle"));
        assert!(!is_valid_object_id("1c"));
        assert!(!is_valid_object_id("a".repeat(33).as_str()));
        assert!(is_valid_object_id("a".repeat(32).as_str()));
    }

    #[test]
    fn unknown_kind_survives_parsing() {
        let raw = r#"{
            "scene_kind": "2d",
            "duration_hint": 5.0,
            "background": "BLACK",
            "objects": [{"id": "x", "kind": "os.system", "params": {}, "style": {}}],
            "steps": []
        }"#;
        let spec: AnimationSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.objects[0].kind, "os.system");
        assert!(ObjectKind::parse(&spec.objects[0].kind).is_none());
    }

    #[test]
    fn content_hash_is_stable() {
        let spec = AnimationSpec {
            scene_kind: SceneKind::TwoD,
            duration_hint: 5.0,
            background: PaletteColor::Black,
            objects: vec![],
            steps: vec![],
            camera: None,
        };
        assert_eq!(spec.content_hash(), spec.content_hash());
        assert_eq!(spec.content_hash().len(), 64);
    }
}

//! Deterministic transform from an animation spec to renderable scene
//! source. No model involvement: equal specs produce byte-identical
//! output.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::spec::{
    is_reserved_object_id, is_valid_object_id, ActionKind, AnimationSpec, ObjectDecl, ObjectKind,
    SceneKind,
};

pub const SCENE_CLASS: &str = "GeneratedScene";

#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthError {
    #[error("unknown vocabulary: {token:?}")]
    UnknownVocabulary { token: String },
}

/// Fixed-precision float formatting; no language repr leakage.
fn num(value: f64) -> String {
    format!("{:.6}", value)
}

fn param_f64(params: &BTreeMap<String, Value>, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn param_vec2(params: &BTreeMap<String, Value>, key: &str, default: [f64; 2]) -> [f64; 2] {
    let Some(arr) = params.get(key).and_then(Value::as_array) else {
        return default;
    };
    let x = arr.first().and_then(Value::as_f64).unwrap_or(default[0]);
    let y = arr.get(1).and_then(Value::as_f64).unwrap_or(default[1]);
    [x, y]
}

fn param_range(params: &BTreeMap<String, Value>, key: &str, default: [f64; 3]) -> [f64; 3] {
    let Some(arr) = params.get(key).and_then(Value::as_array) else {
        return default;
    };
    let mut out = default;
    for (slot, value) in out.iter_mut().zip(arr.iter()) {
        if let Some(v) = value.as_f64() {
            *slot = v;
        }
    }
    out
}

fn vec3(x: f64, y: f64) -> String {
    format!("np.array([{}, {}, {}])", num(x), num(y), num(0.0))
}

fn escape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn constructor(object: &ObjectDecl, kind: ObjectKind) -> String {
    let params = &object.params;
    match kind {
        ObjectKind::Text => {
            let text = params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("");
            let font_size = param_f64(params, "font_size", 48.0);
            format!(
                "Text(\"{}\", font_size={})",
                escape_text(text),
                num(font_size)
            )
        }
        ObjectKind::Circle => format!("Circle(radius={})", num(param_f64(params, "radius", 1.0))),
        ObjectKind::Square => format!(
            "Square(side_length={})",
            num(param_f64(params, "side_length", 2.0))
        ),
        ObjectKind::Rectangle => format!(
            "Rectangle(width={}, height={})",
            num(param_f64(params, "width", 4.0)),
            num(param_f64(params, "height", 2.0))
        ),
        ObjectKind::Triangle => "Triangle()".to_string(),
        ObjectKind::Line | ObjectKind::Arrow => {
            let start = param_vec2(params, "start", [-2.0, 0.0]);
            let end = param_vec2(params, "end", [2.0, 0.0]);
            format!(
                "{}(start={}, end={})",
                kind.token(),
                vec3(start[0], start[1]),
                vec3(end[0], end[1])
            )
        }
        ObjectKind::Dot => {
            let point = param_vec2(params, "point", [0.0, 0.0]);
            format!(
                "Dot(point={}, radius={})",
                vec3(point[0], point[1]),
                num(param_f64(params, "radius", 0.08))
            )
        }
        ObjectKind::VGroup => {
            let members: Vec<&str> = params
                .get("of")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            format!("VGroup({})", members.join(", "))
        }
        ObjectKind::Axes => {
            let x = param_range(params, "x_range", [-5.0, 5.0, 1.0]);
            let y = param_range(params, "y_range", [-3.0, 3.0, 1.0]);
            format!(
                "Axes(x_range=[{}, {}, {}], y_range=[{}, {}, {}])",
                num(x[0]),
                num(x[1]),
                num(x[2]),
                num(y[0]),
                num(y[1]),
                num(y[2])
            )
        }
        ObjectKind::ParametricFunction => {
            let curve = params
                .get("curve")
                .and_then(Value::as_str)
                .unwrap_or("sine");
            let body = match curve {
                "cosine" => format!("np.array([t, np.cos(t), {}])", num(0.0)),
                "parabola" => format!("np.array([t, {} * t * t, {}])", num(0.25), num(0.0)),
                "circle" => format!("np.array([np.cos(t), np.sin(t), {}])", num(0.0)),
                "spiral" => format!(
                    "np.array([{s} * t * np.cos(t), {s} * t * np.sin(t), {z}])",
                    s = num(0.15),
                    z = num(0.0)
                ),
                "lissajous" => format!(
                    "np.array([np.sin({} * t), np.sin({} * t), {}])",
                    num(3.0),
                    num(2.0),
                    num(0.0)
                ),
                // sine, and anything the palette-checked schema let through
                _ => format!("np.array([t, np.sin(t), {}])", num(0.0)),
            };
            let t_min = param_f64(params, "t_min", 0.0);
            let t_max = param_f64(params, "t_max", std::f64::consts::TAU);
            let scale = param_f64(params, "scale", 1.0);
            format!(
                "ParametricFunction(lambda t: {} * {}, t_range=[{}, {}])",
                body,
                num(scale),
                num(t_min),
                num(t_max)
            )
        }
        ObjectKind::Polygon => {
            let vertices: Vec<String> = params
                .get("points")
                .and_then(Value::as_array)
                .map(|points| {
                    points
                        .iter()
                        .filter_map(Value::as_array)
                        .map(|p| {
                            let x = p.first().and_then(Value::as_f64).unwrap_or(0.0);
                            let y = p.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                            vec3(x, y)
                        })
                        .collect()
                })
                .unwrap_or_default();
            if vertices.len() < 3 {
                format!(
                    "Polygon({}, {}, {})",
                    vec3(-1.0, 0.0),
                    vec3(1.0, 0.0),
                    vec3(0.0, 1.5)
                )
            } else {
                format!("Polygon({})", vertices.join(", "))
            }
        }
        ObjectKind::RegularPolygon => {
            let n = params
                .get("n")
                .and_then(Value::as_i64)
                .unwrap_or(5)
                .clamp(3, 12);
            format!("RegularPolygon(n={})", n)
        }
    }
}

fn emit_step(
    out: &mut String,
    action: ActionKind,
    step: &crate::spec::StepDecl,
) {
    let targets = &step.target_ids;
    let call = match action {
        ActionKind::Create
        | ActionKind::Write
        | ActionKind::FadeIn
        | ActionKind::FadeOut => format!("{}({})", action.token(), targets[0]),
        ActionKind::Transform | ActionKind::ReplacementTransform | ActionKind::MoveAlongPath => {
            format!("{}({}, {})", action.token(), targets[0], targets[1])
        }
        ActionKind::Rotate => {
            let angle = param_f64(&step.params, "angle", std::f64::consts::FRAC_PI_2);
            format!("Rotate({}, angle={})", targets[0], num(angle))
        }
        ActionKind::Scale => {
            let factor = param_f64(&step.params, "factor", 2.0);
            format!("Scale({}, scale_factor={})", targets[0], num(factor))
        }
        ActionKind::Shift => {
            let by = param_vec2(&step.params, "by", [1.0, 0.0]);
            format!("Shift({}, direction={})", targets[0], vec3(by[0], by[1]))
        }
    };
    out.push_str(&format!(
        "        self.play({}, run_time={})\n",
        call,
        num(step.run_time)
    ));
    if step.wait_after > 0.0 {
        out.push_str(&format!("        self.wait({})\n", num(step.wait_after)));
    }
}

/// Synthesize scene source for a spec. Refuses unknown kinds/actions; the
/// output of a successful call always passes the source validator.
pub fn synthesize(spec: &AnimationSpec) -> Result<String, SynthError> {
    // Resolve the whole vocabulary up front so nothing is emitted for a
    // spec that names an unknown tag or an unusable binding.
    let mut kinds = Vec::with_capacity(spec.objects.len());
    for object in &spec.objects {
        if !is_valid_object_id(&object.id) || is_reserved_object_id(&object.id) {
            return Err(SynthError::UnknownVocabulary {
                token: object.id.clone(),
            });
        }
        let kind = ObjectKind::parse(&object.kind).ok_or(SynthError::UnknownVocabulary {
            token: object.kind.clone(),
        })?;
        kinds.push(kind);
    }
    let mut actions = Vec::with_capacity(spec.steps.len());
    for step in &spec.steps {
        let action = ActionKind::parse(&step.action).ok_or(SynthError::UnknownVocabulary {
            token: step.action.clone(),
        })?;
        actions.push(action);
    }

    let mut out = String::new();
    out.push_str("from manim import *\n");
    out.push_str("import numpy as np\n");
    out.push_str("\n\n");
    out.push_str(&format!(
        "class {}({}):\n",
        SCENE_CLASS,
        spec.scene_kind.scene_base()
    ));
    out.push_str("    def construct(self):\n");
    out.push_str(&format!(
        "        self.camera.background_color = {}\n",
        spec.background.token()
    ));

    if let Some(camera) = &spec.camera {
        if spec.scene_kind == SceneKind::MovingCamera {
            if let Some([x, y]) = camera.center {
                out.push_str(&format!(
                    "        self.camera.frame.move_to({})\n",
                    vec3(x, y)
                ));
            }
            if let Some(zoom) = camera.zoom {
                if zoom > 0.0 {
                    out.push_str(&format!(
                        "        self.camera.frame.scale({})\n",
                        num(1.0 / zoom)
                    ));
                }
            }
        }
        if spec.scene_kind == SceneKind::ThreeD {
            let phi = camera.phi.unwrap_or(1.047198);
            let theta = camera.theta.unwrap_or(-0.785398);
            out.push_str(&format!(
                "        self.set_camera_orientation(phi={}, theta={})\n",
                num(phi),
                num(theta)
            ));
        }
    }

    for (object, kind) in spec.objects.iter().zip(kinds.iter()) {
        out.push_str(&format!(
            "        {} = {}\n",
            object.id,
            constructor(object, *kind)
        ));
        if let Some(position) = object.params.get("position").and_then(Value::as_array) {
            let x = position.first().and_then(Value::as_f64).unwrap_or(0.0);
            let y = position.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            out.push_str(&format!("        {}.move_to({})\n", object.id, vec3(x, y)));
        }
        let style = &object.style;
        out.push_str(&format!(
            "        {}.set_color({})\n",
            object.id,
            style.color.map(|c| c.token()).unwrap_or("WHITE")
        ));
        out.push_str(&format!(
            "        {}.set_stroke(width={})\n",
            object.id,
            num(style.stroke_width.unwrap_or(2.0))
        ));
        out.push_str(&format!(
            "        {}.set_fill(opacity={})\n",
            object.id,
            num(style.fill_opacity.unwrap_or(0.0))
        ));
        out.push_str(&format!(
            "        {}.set_z_index({})\n",
            object.id,
            style.z_index.unwrap_or(0)
        ));
    }

    for (step, action) in spec.steps.iter().zip(actions.iter()) {
        emit_step(&mut out, *action, step);
    }

    Ok(out)
}

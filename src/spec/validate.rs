//! Spec-level structural validation, applied before any source is
//! synthesized. Violations are repairable schema errors fed back to the
//! model.

use std::collections::HashSet;

use super::{
    is_reserved_object_id, is_valid_object_id, ActionKind, AnimationSpec, ObjectKind, SceneKind,
    MAX_OBJECTS, MAX_PLAYTIME_S, MAX_STEPS,
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("spec violation: {message}")]
pub struct SpecViolation {
    pub message: String,
}

impl SpecViolation {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn validate_spec(spec: &AnimationSpec) -> Result<(), SpecViolation> {
    if !(1.0..=30.0).contains(&spec.duration_hint) {
        return Err(SpecViolation::new(format!(
            "duration_hint {} outside 1..30",
            spec.duration_hint
        )));
    }
    if spec.objects.len() > MAX_OBJECTS {
        return Err(SpecViolation::new(format!(
            "{} objects exceed the limit of {}",
            spec.objects.len(),
            MAX_OBJECTS
        )));
    }
    if spec.steps.len() > MAX_STEPS {
        return Err(SpecViolation::new(format!(
            "{} steps exceed the limit of {}",
            spec.steps.len(),
            MAX_STEPS
        )));
    }
    if spec.steps.is_empty() {
        return Err(SpecViolation::new("spec declares no steps"));
    }

    let total = spec.total_playtime();
    if total > MAX_PLAYTIME_S + 1e-9 {
        return Err(SpecViolation::new(format!(
            "total playtime {:.3}s exceeds the {}s cap",
            total, MAX_PLAYTIME_S
        )));
    }

    let mut declared: HashSet<&str> = HashSet::new();
    for (index, object) in spec.objects.iter().enumerate() {
        if !is_valid_object_id(&object.id) {
            return Err(SpecViolation::new(format!(
                "object {} id {:?} does not match [a-z][a-z0-9_]{{0,31}}",
                index, object.id
            )));
        }
        if is_reserved_object_id(&object.id) {
            return Err(SpecViolation::new(format!(
                "object id {:?} is a reserved name",
                object.id
            )));
        }
        if !declared.insert(object.id.as_str()) {
            return Err(SpecViolation::new(format!(
                "duplicate object id {:?}",
                object.id
            )));
        }
        // Unknown kinds are left for the synthesizer to refuse; only the
        // recognized vocabulary gets param-key checks here.
        if let Some(kind) = ObjectKind::parse(&object.kind) {
            for key in object.params.keys() {
                if key != "position" && !kind.recognized_params().contains(&key.as_str()) {
                    return Err(SpecViolation::new(format!(
                        "object {:?}: unrecognized param key {:?} for kind {}",
                        object.id,
                        key,
                        kind.token()
                    )));
                }
            }
            // VGroup members must already be declared when the group
            // appears.
            if kind == ObjectKind::VGroup {
                if let Some(members) = object.params.get("of").and_then(|v| v.as_array()) {
                    for member in members {
                        let id = member.as_str().unwrap_or("");
                        if !declared.contains(id) || id == object.id {
                            return Err(SpecViolation::new(format!(
                                "VGroup {:?} references undeclared member {:?}",
                                object.id, member
                            )));
                        }
                    }
                }
            }
        }
        if let Some(width) = object.style.stroke_width {
            if !(0.0..=32.0).contains(&width) {
                return Err(SpecViolation::new(format!(
                    "object {:?}: stroke_width {} outside 0..32",
                    object.id, width
                )));
            }
        }
        if let Some(opacity) = object.style.fill_opacity {
            if !(0.0..=1.0).contains(&opacity) {
                return Err(SpecViolation::new(format!(
                    "object {:?}: fill_opacity {} outside 0..1",
                    object.id, opacity
                )));
            }
        }
    }

    for (index, step) in spec.steps.iter().enumerate() {
        if step.target_ids.is_empty() {
            return Err(SpecViolation::new(format!(
                "step {}: empty target_ids",
                index
            )));
        }
        for target in &step.target_ids {
            if !declared.contains(target.as_str()) {
                return Err(SpecViolation::new(format!(
                    "step {}: target {:?} is not a declared object",
                    index, target
                )));
            }
        }
        // As with kinds, unknown actions fall through to the synthesizer.
        if let Some(action) = ActionKind::parse(&step.action) {
            if action.is_binary() && step.target_ids.len() != 2 {
                return Err(SpecViolation::new(format!(
                    "step {}: {} takes exactly two targets",
                    index,
                    action.token()
                )));
            }
            if !action.is_binary() && step.target_ids.len() != 1 {
                return Err(SpecViolation::new(format!(
                    "step {}: {} takes exactly one target",
                    index,
                    action.token()
                )));
            }
            for key in step.params.keys() {
                if !action.recognized_params().contains(&key.as_str()) {
                    return Err(SpecViolation::new(format!(
                        "step {}: unrecognized param key {:?} for action {}",
                        index,
                        key,
                        action.token()
                    )));
                }
            }
        }
        if !(0.1..=10.0).contains(&step.run_time) {
            return Err(SpecViolation::new(format!(
                "step {}: run_time {} outside 0.1..10",
                index, step.run_time
            )));
        }
        if !(0.0..=5.0).contains(&step.wait_after) {
            return Err(SpecViolation::new(format!(
                "step {}: wait_after {} outside 0..5",
                index, step.wait_after
            )));
        }
    }

    if let Some(camera) = &spec.camera {
        let wants_frame = camera.center.is_some() || camera.zoom.is_some();
        let wants_orientation = camera.phi.is_some() || camera.theta.is_some();
        if wants_frame && spec.scene_kind != SceneKind::MovingCamera {
            return Err(SpecViolation::new(
                "camera center/zoom requires scene_kind moving_camera",
            ));
        }
        if wants_orientation && spec.scene_kind != SceneKind::ThreeD {
            return Err(SpecViolation::new(
                "camera phi/theta requires scene_kind 3d",
            ));
        }
        if let Some(zoom) = camera.zoom {
            if !(0.1..=10.0).contains(&zoom) {
                return Err(SpecViolation::new(format!(
                    "camera zoom {} outside 0.1..10",
                    zoom
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ObjectDecl, PaletteColor, StepDecl, StyleDecl};
    use std::collections::BTreeMap;

    fn object(id: &str, kind: &str) -> ObjectDecl {
        ObjectDecl {
            id: id.to_string(),
            kind: kind.to_string(),
            params: BTreeMap::new(),
            style: StyleDecl::default(),
        }
    }

    fn step(action: &str, targets: &[&str], run_time: f64, wait_after: f64) -> StepDecl {
        StepDecl {
            action: action.to_string(),
            target_ids: targets.iter().map(|s| s.to_string()).collect(),
            params: BTreeMap::new(),
            run_time,
            wait_after,
        }
    }

    fn base_spec() -> AnimationSpec {
        AnimationSpec {
            scene_kind: SceneKind::TwoD,
            duration_hint: 5.0,
            background: PaletteColor::Black,
            objects: vec![object("c", "Circle")],
            steps: vec![step("FadeIn", &["c"], 1.0, 0.5)],
            camera: None,
        }
    }

    #[test]
    fn accepts_simple_spec() {
        assert!(validate_spec(&base_spec()).is_ok());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut spec = base_spec();
        spec.objects.push(object("c", "Square"));
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn rejects_reserved_id() {
        let mut spec = base_spec();
        spec.objects[0].id = "lambda".to_string();
        spec.steps[0].target_ids = vec!["lambda".to_string()];
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.message.contains("reserved"));
    }

    #[test]
    fn rejects_undeclared_target() {
        let mut spec = base_spec();
        spec.steps[0].target_ids = vec!["ghost".to_string()];
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.message.contains("not a declared object"));
    }

    #[test]
    fn rejects_unknown_param_key() {
        let mut spec = base_spec();
        spec.objects[0]
            .params
            .insert("side_length".to_string(), serde_json::json!(2.0));
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.message.contains("unrecognized param"));
    }

    #[test]
    fn boundary_object_and_step_counts() {
        let mut spec = base_spec();
        spec.objects = (0..MAX_OBJECTS)
            .map(|i| object(&format!("o{}", i), "Circle"))
            .collect();
        spec.steps = (0..MAX_STEPS)
            .map(|_| step("FadeIn", &["o0"], 0.1, 0.0))
            .collect();
        assert!(validate_spec(&spec).is_ok());

        spec.objects.push(object("overflow", "Circle"));
        assert!(validate_spec(&spec).is_err());
        spec.objects.pop();
        spec.steps.push(step("FadeIn", &["o0"], 0.1, 0.0));
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn boundary_playtime() {
        let mut spec = base_spec();
        // Exactly 60s: 100 steps of 0.5 + 0.1.
        spec.objects = vec![object("c", "Circle")];
        spec.steps = (0..100).map(|_| step("FadeIn", &["c"], 0.5, 0.1)).collect();
        assert!((spec.total_playtime() - 60.0).abs() < 1e-6);
        assert!(validate_spec(&spec).is_ok());

        spec.steps[0].wait_after = 0.101;
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn binary_actions_need_two_targets() {
        let mut spec = base_spec();
        spec.objects.push(object("d", "Square"));
        spec.steps = vec![step("Transform", &["c"], 1.0, 0.0)];
        assert!(validate_spec(&spec).is_err());
        spec.steps = vec![step("Transform", &["c", "d"], 1.0, 0.0)];
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn camera_requires_matching_scene_kind() {
        let mut spec = base_spec();
        spec.camera = Some(crate::spec::CameraDecl {
            zoom: Some(2.0),
            ..Default::default()
        });
        assert!(validate_spec(&spec).is_err());
        spec.scene_kind = SceneKind::MovingCamera;
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn vgroup_members_must_precede_group() {
        let mut spec = base_spec();
        let mut group = object("g", "VGroup");
        group
            .params
            .insert("of".to_string(), serde_json::json!(["c"]));
        spec.objects.push(group);
        assert!(validate_spec(&spec).is_ok());

        let mut forward = object("h", "VGroup");
        forward
            .params
            .insert("of".to_string(), serde_json::json!(["later"]));
        spec.objects.insert(0, forward);
        assert!(validate_spec(&spec).is_err());
    }
}

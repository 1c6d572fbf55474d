//! Built-in component kinds understood by prediction and interpolation.

use crate::components::ComponentValue;
use crate::registry::{ComponentError, NetComponent};
use glam::{Quat, Vec3};

/// Positional transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// World position.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Non-uniform scale.
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Identity rotation and unit scale at `position`.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

impl NetComponent for Transform {
    const NAME: &'static str = "Transform";

    fn to_value(&self) -> ComponentValue {
        ComponentValue::map([
            ("position", ComponentValue::from(self.position)),
            ("rotation", ComponentValue::from(self.rotation)),
            ("scale", ComponentValue::from(self.scale)),
        ])
    }

    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError> {
        if value.as_map().is_none() {
            return Err(ComponentError::Shape(Self::NAME));
        }
        let position = value
            .field("position")
            .ok_or(ComponentError::MissingField {
                component: Self::NAME,
                field: "position",
            })?
            .as_vec3()
            .ok_or(ComponentError::InvalidField {
                component: Self::NAME,
                field: "position",
            })?;
        let rotation = match value.field("rotation") {
            None => Quat::IDENTITY,
            Some(v) => v.as_quat().ok_or(ComponentError::InvalidField {
                component: Self::NAME,
                field: "rotation",
            })?,
        };
        let scale = match value.field("scale") {
            None => Vec3::ONE,
            Some(v) => v.as_vec3().ok_or(ComponentError::InvalidField {
                component: Self::NAME,
                field: "scale",
            })?,
        };
        Ok(Self {
            position,
            rotation,
            scale,
        })
    }
}

/// Linear velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity(pub Vec3);

impl NetComponent for Velocity {
    const NAME: &'static str = "Velocity";

    fn to_value(&self) -> ComponentValue {
        ComponentValue::from(self.0)
    }

    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError> {
        value
            .as_vec3()
            .map(Velocity)
            .ok_or(ComponentError::Shape(Self::NAME))
    }
}

/// Movement-relevant player input.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerInput {
    /// Forward axis in `[-1, 1]`.
    pub forward: f32,
    /// Strafe axis in `[-1, 1]`.
    pub strafe: f32,
    /// Jump requested this tick.
    pub jump: bool,
    /// Sprint held.
    pub sprint: bool,
    /// Facing yaw in radians.
    pub yaw: f32,
}

impl PlayerInput {
    /// Input with no movement.
    pub fn idle() -> Self {
        Self::default()
    }
}

impl NetComponent for PlayerInput {
    const NAME: &'static str = "PlayerInput";

    fn to_value(&self) -> ComponentValue {
        ComponentValue::map([
            ("forward", ComponentValue::from(self.forward)),
            ("strafe", ComponentValue::from(self.strafe)),
            ("jump", ComponentValue::Bool(self.jump)),
            ("sprint", ComponentValue::Bool(self.sprint)),
            ("yaw", ComponentValue::from(self.yaw)),
        ])
    }

    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError> {
        if value.as_map().is_none() {
            return Err(ComponentError::Shape(Self::NAME));
        }
        let axis = |field: &'static str| -> Result<f32, ComponentError> {
            let v = match value.field(field) {
                None => 0.0,
                Some(v) => v.as_float().ok_or(ComponentError::InvalidField {
                    component: Self::NAME,
                    field,
                })? as f32,
            };
            if v.is_finite() {
                Ok(v)
            } else {
                Err(ComponentError::InvalidField {
                    component: Self::NAME,
                    field,
                })
            }
        };
        let flag = |field: &'static str| -> Result<bool, ComponentError> {
            match value.field(field) {
                None => Ok(false),
                Some(v) => v.as_bool().ok_or(ComponentError::InvalidField {
                    component: Self::NAME,
                    field,
                }),
            }
        };

        let forward = axis("forward")?;
        let strafe = axis("strafe")?;
        if !(-1.0..=1.0).contains(&forward) {
            return Err(ComponentError::InvalidField {
                component: Self::NAME,
                field: "forward",
            });
        }
        if !(-1.0..=1.0).contains(&strafe) {
            return Err(ComponentError::InvalidField {
                component: Self::NAME,
                field: "strafe",
            });
        }

        Ok(Self {
            forward,
            strafe,
            jump: flag("jump")?,
            sprint: flag("sprint")?,
            yaw: axis("yaw")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_defaults_missing_rotation_and_scale() {
        let value = ComponentValue::map([("position", ComponentValue::Vec3([1.0, 2.0, 3.0]))]);
        let transform = Transform::from_value(&value).expect("decode");
        assert_eq!(transform.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(transform.rotation, Quat::IDENTITY);
        assert_eq!(transform.scale, Vec3::ONE);
    }

    #[test]
    fn transform_requires_position() {
        let value = ComponentValue::map([("scale", ComponentValue::Vec3([1.0, 1.0, 1.0]))]);
        assert_eq!(
            Transform::from_value(&value),
            Err(ComponentError::MissingField {
                component: "Transform",
                field: "position",
            })
        );
    }

    #[test]
    fn player_input_rejects_out_of_range_axes() {
        let input = PlayerInput {
            forward: 2.0,
            ..PlayerInput::idle()
        };
        assert!(PlayerInput::from_value(&input.to_value()).is_err());

        let ok = PlayerInput {
            forward: 1.0,
            strafe: -0.5,
            jump: true,
            sprint: false,
            yaw: 1.25,
        };
        assert_eq!(PlayerInput::from_value(&ok.to_value()), Ok(ok));
    }

    #[test]
    fn velocity_is_a_bare_vector() {
        let v = Velocity(Vec3::new(0.0, -9.8, 0.0));
        assert_eq!(v.to_value(), ComponentValue::Vec3([0.0, -9.8, 0.0]));
        assert_eq!(Velocity::from_value(&v.to_value()), Ok(v));
    }
}

use anyhow::{Context, Result};
use glam::Vec3;
use log::warn;
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::asset::primitive::FIRE_EXTINGUISHER;
use crate::asset::AssetSource;
use crate::error::ViewerError;

/// Largest side of a normalized model, in scene units.
pub const DEFAULT_TARGET_SIZE: f32 = 2.0;

/// Which gesture handler owns the pointer stream. Exactly one can be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionMode {
    /// Drag rotates the model itself.
    CustomDrag,
    /// Drag orbits the camera around the model.
    Orbit,
    Disabled,
}

impl InteractionMode {
    /// Resolves the two capability flags. Custom drag wins when both are set
    /// so that two handlers never transform the scene from the same input.
    pub fn from_flags(enable_orbit_controls: bool, enable_custom_drag: bool) -> Self {
        match (enable_orbit_controls, enable_custom_drag) {
            (_, true) => {
                if enable_orbit_controls {
                    warn!("orbit controls and custom drag both requested; using custom drag");
                }
                InteractionMode::CustomDrag
            }
            (true, false) => InteractionMode::Orbit,
            (false, false) => InteractionMode::Disabled,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "orbit" => Some(InteractionMode::Orbit),
            "drag" | "custom-drag" => Some(InteractionMode::CustomDrag),
            "none" | "disabled" | "off" => Some(InteractionMode::Disabled),
            _ => None,
        }
    }
}

/// Immutable options of one viewer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerConfig {
    pub auto_rotate: bool,
    /// 2.0 is one full turn every 30 seconds.
    pub auto_rotate_speed: f32,
    pub auto_play_animations: bool,
    pub interaction: InteractionMode,
    pub enable_zoom: bool,
    pub enable_pan: bool,
    pub enable_rotate: bool,
    pub target_frame_rate: u32,
    pub background_color: u32,
    pub background_alpha: f32,
    pub loading_label: String,
    pub error_label: String,
    pub target_size: f32,
    pub camera_distance: f32,
    pub field_of_view: f32,
    /// Radians of rotation per pixel dragged.
    pub drag_sensitivity: f32,
    pub max_retries: u32,
    pub shadows: bool,
    pub shadow_map_size: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            auto_rotate: true,
            auto_rotate_speed: 0.5,
            auto_play_animations: true,
            interaction: InteractionMode::CustomDrag,
            enable_zoom: true,
            enable_pan: false,
            enable_rotate: true,
            target_frame_rate: 60,
            background_color: 0xf5f5f5,
            background_alpha: 0.0,
            loading_label: "Loading 3D model...".to_string(),
            error_label: "Unable to load the 3D model.".to_string(),
            target_size: DEFAULT_TARGET_SIZE,
            camera_distance: 5.0,
            field_of_view: 45.0,
            drag_sensitivity: 0.01,
            max_retries: 3,
            shadows: true,
            shadow_map_size: 1024,
        }
    }
}

impl ViewerConfig {
    pub fn validate(&self) -> Result<(), ViewerError> {
        if self.target_frame_rate == 0 {
            return Err(ViewerError::invalid_config("targetFrameRate must be at least 1"));
        }
        let positive = [
            ("targetSize", self.target_size),
            ("cameraDistance", self.camera_distance),
            ("dragSensitivity", self.drag_sensitivity),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ViewerError::invalid_config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.field_of_view > 0.0 && self.field_of_view < 180.0) {
            return Err(ViewerError::invalid_config(format!(
                "fieldOfView must be between 0 and 180 degrees, got {}",
                self.field_of_view
            )));
        }
        if !self.auto_rotate_speed.is_finite() {
            return Err(ViewerError::invalid_config("autoRotateSpeed must be finite"));
        }
        Ok(())
    }

    /// Auto-rotation in radians per second.
    pub fn auto_rotate_rate(&self) -> f32 {
        self.auto_rotate_speed * std::f32::consts::TAU / 60.0
    }

    pub fn clear_color(&self) -> [f64; 4] {
        let rgb = hex_to_rgb(self.background_color);
        [
            rgb.x as f64,
            rgb.y as f64,
            rgb.z as f64,
            self.background_alpha.clamp(0.0, 1.0) as f64,
        ]
    }
}

pub fn hex_to_rgb(hex: u32) -> Vec3 {
    Vec3::new(
        ((hex >> 16) & 0xff) as f32 / 255.0,
        ((hex >> 8) & 0xff) as f32 / 255.0,
        (hex & 0xff) as f32 / 255.0,
    )
}

/// `#rrggbb` or `rrggbb`.
pub fn parse_hex_color(value: &str) -> Option<u32> {
    let digits = value.trim().trim_start_matches('#');
    if digits.len() != 6 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Viewer container found in host page markup.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub id: String,
    pub source: AssetSource,
    pub config: ViewerConfig,
    pub hero: bool,
}

/// Finds every `data-model-viewer` / `data-hero-model-viewer` element in a
/// page fragment and derives its source and options from `data-*` attributes.
pub fn discover_viewers(markup: &str) -> Result<Vec<ContainerSpec>> {
    let document = Document::parse(markup).context("invalid page markup")?;
    let mut specs = Vec::new();
    for node in document.descendants().filter(Node::is_element) {
        let id = node.attribute("id").unwrap_or_default().to_string();
        let attribute = |name: &str| node.attribute(name).map(str::to_string);
        if let Some(spec) = ContainerSpec::from_attributes(id, attribute) {
            specs.push(spec);
        }
    }
    Ok(specs)
}

impl ContainerSpec {
    /// Describes one element from its attributes, or `None` if the
    /// element is not a viewer container or names no model.
    pub fn from_attributes(id: String, attribute: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let hero = attribute("data-hero-model-viewer").is_some();
        if !hero && attribute("data-model-viewer").is_none() {
            return None;
        }
        let parse_f32 = |name: &str| attribute(name).and_then(|v| v.trim().parse::<f32>().ok());

        let mut config = ViewerConfig::default();
        let source = match attribute("data-model-path") {
            Some(path) if !path.trim().is_empty() => AssetSource::new(path),
            _ if hero => {
                let color = attribute("data-model-color").and_then(|c| parse_hex_color(&c));
                let builtin = match color {
                    Some(color) => format!("{FIRE_EXTINGUISHER}#{color:06x}"),
                    None => FIRE_EXTINGUISHER.to_string(),
                };
                AssetSource::builtin(&builtin)
            }
            _ => {
                warn!("skipping viewer container `{id}` without a model source");
                return None;
            }
        };

        config.interaction = if hero {
            InteractionMode::Disabled
        } else {
            InteractionMode::Orbit
        };
        if let Some(mode) = attribute("data-interaction").and_then(|m| InteractionMode::parse(&m)) {
            config.interaction = mode;
        }
        if let Some(value) = attribute("data-auto-rotate") {
            config.auto_rotate = value.trim() != "false";
        }
        if let Some(speed) = parse_f32("data-rotate-speed").filter(|s| *s > 0.0) {
            config.auto_rotate_speed = speed;
        }
        if let Some(scale) = parse_f32("data-scale").filter(|s| *s > 0.0) {
            config.target_size = DEFAULT_TARGET_SIZE * scale;
        }
        if let Some(fps) = attribute("data-fps")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|f| *f > 0)
        {
            config.target_frame_rate = fps;
        }
        if let Some(color) = attribute("data-background").and_then(|c| parse_hex_color(&c)) {
            config.background_color = color;
            config.background_alpha = 1.0;
        }
        if hero {
            config.camera_distance = 3.0;
        }

        Some(Self {
            id,
            source,
            config,
            hero,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
    <main>
        <section class="hero">
            <div id="hero-viewer" data-hero-model-viewer="" data-rotate-speed="1.5"
                 data-scale="1.5" data-model-color="#00aa00"/>
        </section>
        <div id="product" data-model-viewer="" data-model-path="/models/valve.obj"
             data-auto-rotate="false" data-interaction="drag" data-fps="30"/>
        <div id="broken" data-model-viewer=""/>
        <div id="dark" data-model-viewer="" data-model-path="m.obj" data-background="#101010"/>
        <div id="plain"/>
    </main>
    "##;

    #[test]
    fn discovers_hero_and_product_viewers() {
        let specs = discover_viewers(PAGE).unwrap();
        assert_eq!(specs.len(), 3);

        let hero = &specs[0];
        assert!(hero.hero);
        assert_eq!(hero.source.as_str(), "builtin:fire-extinguisher#00aa00");
        assert_eq!(hero.config.interaction, InteractionMode::Disabled);
        assert!(hero.config.auto_rotate);
        assert_eq!(hero.config.auto_rotate_speed, 1.5);
        assert!((hero.config.target_size - 3.0).abs() < f32::EPSILON);

        let product = &specs[1];
        assert_eq!(product.id, "product");
        assert_eq!(product.source.as_str(), "/models/valve.obj");
        assert!(!product.config.auto_rotate);
        assert_eq!(product.config.interaction, InteractionMode::CustomDrag);
        assert_eq!(product.config.target_frame_rate, 30);

        let dark = &specs[2];
        assert_eq!(dark.config.interaction, InteractionMode::Orbit);
        assert_eq!(dark.config.clear_color()[3], 1.0);
    }

    #[test]
    fn both_flags_resolve_to_a_single_handler() {
        assert_eq!(
            InteractionMode::from_flags(true, true),
            InteractionMode::CustomDrag
        );
        assert_eq!(InteractionMode::from_flags(true, false), InteractionMode::Orbit);
        assert_eq!(
            InteractionMode::from_flags(false, false),
            InteractionMode::Disabled
        );
    }

    #[test]
    fn validate_rejects_zero_frame_rate() {
        let config = ViewerConfig {
            target_frame_rate: 0,
            ..ViewerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ViewerError::InvalidConfig(_))));
        ViewerConfig::default().validate().unwrap();
    }

    #[test]
    fn hex_colors_convert_to_unit_rgb() {
        assert_eq!(parse_hex_color("#f5f5f5"), Some(0xf5f5f5));
        assert_eq!(parse_hex_color("f5f"), None);
        assert_eq!(hex_to_rgb(0xff8000), Vec3::new(1.0, 128.0 / 255.0, 0.0));
    }
}

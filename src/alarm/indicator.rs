//! Alarm indicator widget.
//!
//! An [`AlarmIndicator`] follows one aggregator's summary through a
//! `watch::Receiver` and keeps a five-valued [`AlarmColor`]. Drawing is
//! delegated to an [`IndicatorShape`] strategy, so a circle, a triangle or
//! any custom outline share the same indicator type.
//!
//! The indicator is meant to live inside an egui frame loop: `ui()` pulls the
//! latest summary and paints the shape in one call.

use egui::{Color32, Painter, Pos2, Rect, Response, Sense, Shape, Stroke, Ui, Vec2};
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, TAU};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::alarm::aggregator::AlarmAggregator;
use crate::alarm::level::AlarmLevel;
use crate::error::TyphosError;

/// Outline pen width in points.
const PEN_WIDTH: f32 = 2.0;

/// Vertices used to approximate an ellipse.
const ELLIPSE_SEGMENTS: usize = 32;

/// Display state of an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmColor {
    /// Disconnected
    White,
    /// No alarm
    Green,
    /// Minor alarm
    Yellow,
    /// Major alarm
    Red,
    /// Invalid
    Magenta,
}

impl AlarmColor {
    /// Colour shown for `level`.
    pub fn for_level(level: AlarmLevel) -> Self {
        match level {
            AlarmLevel::Disconnected => AlarmColor::White,
            AlarmLevel::NoAlarm => AlarmColor::Green,
            AlarmLevel::Minor => AlarmColor::Yellow,
            AlarmLevel::Major => AlarmColor::Red,
            AlarmLevel::Invalid => AlarmColor::Magenta,
        }
    }

    /// Colour for a raw summary value (`0..=3` severities, `4` disconnected).
    ///
    /// Anything else is reported and shown as `Invalid`.
    pub fn for_raw_level(raw: i64) -> Self {
        match raw {
            4 => AlarmColor::White,
            other => match AlarmLevel::from_raw(other) {
                Ok(level) => Self::for_level(level),
                Err(e) => {
                    warn!(error = %e, "unexpected alarm level, showing INVALID");
                    AlarmColor::Magenta
                }
            },
        }
    }

    /// Fill colour as `[r, g, b, a]`.
    pub fn rgba(self) -> [u8; 4] {
        match self {
            AlarmColor::White => [255, 255, 255, 255],
            AlarmColor::Green => [0, 255, 0, 255],
            AlarmColor::Yellow => [255, 255, 0, 255],
            AlarmColor::Red => [255, 0, 0, 255],
            AlarmColor::Magenta => [255, 0, 255, 255],
        }
    }

    /// Fill colour for egui.
    pub fn to_color32(self) -> Color32 {
        let [r, g, b, a] = self.rgba();
        Color32::from_rgba_unmultiplied(r, g, b, a)
    }
}

/// Drawing strategy for an indicator.
pub trait IndicatorShape: Send + Sync {
    /// Short name used in logs and tooltips.
    fn name(&self) -> &'static str;

    /// Paint the shape filling `rect`.
    fn paint(&self, painter: &Painter, rect: Rect, fill: Color32, stroke: Stroke);
}

/// Built-in indicator outlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// Circle inscribed in the square centred on the rect
    #[default]
    Circle,
    /// The rect itself
    Rectangle,
    /// Upward triangle
    Triangle,
    /// Ellipse touching all four sides
    Ellipse,
    /// Regular polygon
    Polygon {
        /// Number of vertices, at least 3
        sides: usize,
    },
}

impl ShapeKind {
    /// Vertices of the outline inside `rect`.
    ///
    /// Circles and rectangles are drawn natively and return their bounding
    /// corners here.
    pub fn outline(self, rect: Rect) -> Vec<Pos2> {
        let center = rect.center();
        let (rx, ry) = (rect.width() / 2.0, rect.height() / 2.0);
        match self {
            ShapeKind::Circle | ShapeKind::Rectangle => vec![
                rect.left_top(),
                rect.right_top(),
                rect.right_bottom(),
                rect.left_bottom(),
            ],
            ShapeKind::Triangle => vec![
                Pos2::new(center.x, rect.top()),
                rect.right_bottom(),
                rect.left_bottom(),
            ],
            ShapeKind::Ellipse => ring(center, rx, ry, ELLIPSE_SEGMENTS),
            ShapeKind::Polygon { sides } => {
                let r = rx.min(ry);
                ring(center, r, r, sides.max(3))
            }
        }
    }
}

fn ring(center: Pos2, rx: f32, ry: f32, n: usize) -> Vec<Pos2> {
    (0..n)
        .map(|i| {
            // Start at the top so polygons point upwards.
            let angle = TAU * i as f32 / n as f32 - FRAC_PI_2;
            Pos2::new(center.x + rx * angle.cos(), center.y + ry * angle.sin())
        })
        .collect()
}

impl IndicatorShape for ShapeKind {
    fn name(&self) -> &'static str {
        match self {
            ShapeKind::Circle => "circle",
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Triangle => "triangle",
            ShapeKind::Ellipse => "ellipse",
            ShapeKind::Polygon { .. } => "polygon",
        }
    }

    fn paint(&self, painter: &Painter, rect: Rect, fill: Color32, stroke: Stroke) {
        match self {
            ShapeKind::Circle => {
                let radius = rect.width().min(rect.height()) / 2.0;
                painter.circle(rect.center(), radius, fill, stroke);
            }
            ShapeKind::Rectangle => {
                painter.rect(rect, 0.0, fill, stroke);
            }
            shape => {
                painter.add(Shape::convex_polygon(shape.outline(rect), fill, stroke));
            }
        }
    }
}

impl FromStr for ShapeKind {
    type Err = TyphosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "circle" => Ok(ShapeKind::Circle),
            "rectangle" => Ok(ShapeKind::Rectangle),
            "triangle" => Ok(ShapeKind::Triangle),
            "ellipse" => Ok(ShapeKind::Ellipse),
            "polygon" => Ok(ShapeKind::Polygon { sides: 6 }),
            other => Err(TyphosError::Configuration(format!(
                "Unknown indicator shape '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coloured shape that mirrors one aggregator's summary.
pub struct AlarmIndicator {
    shape: Box<dyn IndicatorShape>,
    summary: watch::Receiver<AlarmLevel>,
    level: AlarmLevel,
    color: AlarmColor,
}

impl fmt::Debug for AlarmIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmIndicator")
            .field("shape", &self.shape.name())
            .field("level", &self.level)
            .field("color", &self.color)
            .finish()
    }
}

impl AlarmIndicator {
    /// Bind a shape to a summary receiver.
    pub fn new(shape: impl IndicatorShape + 'static, mut summary: watch::Receiver<AlarmLevel>) -> Self {
        let level = *summary.borrow_and_update();
        Self {
            shape: Box::new(shape),
            summary,
            level,
            color: AlarmColor::for_level(level),
        }
    }

    /// Pull the latest summary. Returns `true` if the colour changed.
    ///
    /// Once the sender is gone the last value it sent is still applied.
    pub fn update(&mut self) -> bool {
        if !self.summary.has_changed().unwrap_or(true) {
            return false;
        }
        let level = *self.summary.borrow_and_update();
        self.set_level(level)
    }

    /// Wait until the summary changes, then apply it.
    ///
    /// Returns `false` once the aggregator is gone.
    pub async fn changed(&mut self) -> bool {
        if self.summary.changed().await.is_err() {
            let level = *self.summary.borrow_and_update();
            self.set_level(level);
            return false;
        }
        let level = *self.summary.borrow_and_update();
        self.set_level(level);
        true
    }

    fn set_level(&mut self, level: AlarmLevel) -> bool {
        self.level = level;
        let color = AlarmColor::for_level(level);
        if color == self.color {
            return false;
        }
        debug!(shape = self.shape.name(), ?color, %level, "indicator colour changed");
        self.color = color;
        true
    }

    /// Summary currently shown.
    pub fn level(&self) -> AlarmLevel {
        self.level
    }

    /// Colour currently shown.
    pub fn color(&self) -> AlarmColor {
        self.color
    }

    /// Name of the drawing strategy.
    pub fn shape_name(&self) -> &'static str {
        self.shape.name()
    }

    /// Paint the indicator at `size`, refreshing it first.
    pub fn ui(&mut self, ui: &mut Ui, size: f32) -> Response {
        self.update();
        let (rect, response) = ui.allocate_exact_size(Vec2::splat(size), Sense::hover());
        if ui.is_rect_visible(rect) {
            let inner = rect.shrink(PEN_WIDTH / 2.0);
            self.shape.paint(
                ui.painter(),
                inner,
                self.color.to_color32(),
                Stroke::new(PEN_WIDTH, Color32::BLACK),
            );
        }
        response.on_hover_text(self.level.to_string())
    }
}

/// Build an indicator bound to `aggregator`.
pub fn create_alarm_indicator(shape: ShapeKind, aggregator: &AlarmAggregator) -> AlarmIndicator {
    AlarmIndicator::new(shape, aggregator.watch())
}

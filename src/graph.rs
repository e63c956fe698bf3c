//! Live probability graph
//!
//! Keeps a rolling window of probability values and draws it as a polyline
//! with the latest value overlaid as a percentage in the bottom-right corner.

use std::collections::VecDeque;
use std::fmt::Write as _;

const STROKE_COLOR: &str = "#FF5733";
const TEXT_COLOR: &str = "#FFFFFF";
const LINE_WIDTH: f64 = 2.0;
const TEXT_MARGIN: f64 = 10.0;

/// Drawing backend the graph renders onto
pub trait DrawSurface {
    fn width(&self) -> f64;
    fn height(&self) -> f64;
    fn clear(&mut self);
    fn stroke_polyline(&mut self, points: &[(f64, f64)], color: &str, line_width: f64);
    /// Draw text whose right edge is anchored at `x`
    fn fill_text_right(&mut self, text: &str, x: f64, y: f64, color: &str);
}

/// Rolling probability series and its renderer
#[derive(Debug, Clone)]
pub struct ProbabilityGraph {
    data: VecDeque<f64>,
    capacity: usize,
    latest: Option<f64>,
}

impl ProbabilityGraph {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            latest: None,
        }
    }

    /// Append a probability and redraw. Values are clamped to [0, 1];
    /// non-finite values are ignored.
    pub fn update<S: DrawSurface>(&mut self, probability: f64, surface: &mut S) {
        self.push(probability);
        self.draw(surface);
    }

    /// Append without drawing
    pub fn push(&mut self, probability: f64) {
        if !probability.is_finite() {
            tracing::debug!("Ignoring non-finite probability");
            return;
        }
        let p = probability.clamp(0.0, 1.0);
        self.latest = Some(p);

        while self.data.len() >= self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(p);
    }

    /// Number of points that fit on a surface of the given width
    pub fn max_plotted(width: f64) -> usize {
        ((width / 2.0).floor() as usize).max(1)
    }

    pub fn draw<S: DrawSurface>(&mut self, surface: &mut S) {
        let width = surface.width();
        let height = surface.height();
        surface.clear();

        let max_points = Self::max_plotted(width);
        while self.data.len() > max_points {
            self.data.pop_front();
        }

        let step = width / max_points as f64;
        let points: Vec<(f64, f64)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as f64 * step, height - p * height))
            .collect();

        if !points.is_empty() {
            surface.stroke_polyline(&points, STROKE_COLOR, LINE_WIDTH);
        }

        if let Some(latest) = self.latest {
            surface.fill_text_right(
                &format_probability(latest),
                width - TEXT_MARGIN,
                height - TEXT_MARGIN,
                TEXT_COLOR,
            );
        }
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.latest
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.latest = None;
    }
}

/// Overlay label, e.g. `Probability: 42.5%`
pub fn format_probability(p: f64) -> String {
    format!("Probability: {:.1}%", p * 100.0)
}

/// Renders to an SVG document
#[derive(Debug, Clone)]
pub struct SvgSurface {
    width: f64,
    height: f64,
    body: String,
}

impl SvgSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f64,
            height: height as f64,
            body: String::new(),
        }
    }

    /// The complete SVG document
    pub fn to_svg(&self) -> String {
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">{body}</svg>"#,
            w = self.width,
            h = self.height,
            body = self.body
        )
    }
}

impl DrawSurface for SvgSurface {
    fn width(&self) -> f64 {
        self.width
    }

    fn height(&self) -> f64 {
        self.height
    }

    fn clear(&mut self) {
        self.body.clear();
    }

    fn stroke_polyline(&mut self, points: &[(f64, f64)], color: &str, line_width: f64) {
        let mut coords = String::new();
        for (i, (x, y)) in points.iter().enumerate() {
            if i > 0 {
                coords.push(' ');
            }
            let _ = write!(coords, "{:.2},{:.2}", x, y);
        }
        let _ = write!(
            self.body,
            r#"<polyline fill="none" stroke="{}" stroke-width="{}" points="{}"/>"#,
            color, line_width, coords
        );
    }

    fn fill_text_right(&mut self, text: &str, x: f64, y: f64, color: &str) {
        let _ = write!(
            self.body,
            r#"<text x="{}" y="{}" fill="{}" font-family="Arial" font-size="24" font-weight="bold" text-anchor="end">{}</text>"#,
            x, y, color, text
        );
    }
}

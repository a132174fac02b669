//! Minimal SVG line plots of logged metrics against iteration.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 400.0;
const MARGIN: f64 = 56.0;
const COLORS: [&str; 4] = ["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728"];

/// One named series of `(x, y)` points.
pub struct Series<'a> {
    pub name: &'a str,
    pub points: Vec<(f64, f64)>,
}

pub fn render(title: &str, series: &[Series<'_>]) -> String {
    let finite: Vec<(f64, f64)> = series
        .iter()
        .flat_map(|s| s.points.iter().copied())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    let (x0, x1) = bounds(finite.iter().map(|p| p.0));
    let (y0, y1) = bounds(finite.iter().map(|p| p.1));
    let sx = |x: f64| MARGIN + (x - x0) / (x1 - x0) * (WIDTH - 2.0 * MARGIN);
    let sy = |y: f64| HEIGHT - MARGIN - (y - y0) / (y1 - y0) * (HEIGHT - 2.0 * MARGIN);

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" font-family="sans-serif" font-size="12">"#
    );
    let _ = writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#);
    let _ = writeln!(svg, r#"<text x="{}" y="20" text-anchor="middle">{}</text>"#, WIDTH / 2.0, escape(title));
    let (left, right, top, bottom) = (MARGIN, WIDTH - MARGIN, MARGIN, HEIGHT - MARGIN);
    let _ = writeln!(
        svg,
        r#"<polyline points="{left},{top} {left},{bottom} {right},{bottom}" fill="none" stroke="black"/>"#
    );
    let _ = writeln!(svg, r#"<text x="{left}" y="{}" text-anchor="start">{}</text>"#, bottom + 18.0, fmt_num(x0));
    let _ = writeln!(svg, r#"<text x="{right}" y="{}" text-anchor="end">{}</text>"#, bottom + 18.0, fmt_num(x1));
    let _ = writeln!(svg, r#"<text x="{}" y="{bottom}" text-anchor="end">{}</text>"#, left - 4.0, fmt_num(y0));
    let _ = writeln!(svg, r#"<text x="{}" y="{}" text-anchor="end">{}</text>"#, left - 4.0, top + 4.0, fmt_num(y1));
    let _ = writeln!(svg, r#"<text x="{}" y="{}" text-anchor="middle">iteration</text>"#, WIDTH / 2.0, HEIGHT - 12.0);

    for (i, s) in series.iter().enumerate() {
        let color = COLORS[i % COLORS.len()];
        let pts: Vec<String> = s
            .points
            .iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|&(x, y)| format!("{:.2},{:.2}", sx(x), sy(y)))
            .collect();
        if !pts.is_empty() {
            let _ = writeln!(svg, r#"<polyline points="{}" fill="none" stroke="{color}"/>"#, pts.join(" "));
        }
        let ly = top + 16.0 * i as f64;
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{ly}" text-anchor="end" fill="{color}">{}</text>"#,
            right - 4.0,
            escape(s.name)
        );
    }
    svg.push_str("</svg>\n");
    svg
}

pub fn write_svg(path: &Path, title: &str, series: &[Series<'_>]) -> Result<()> {
    std::fs::write(path, render(title, series)).with_context(|| format!("Cannot write plot {}", path.display()))
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo < 1e-12 {
        return (lo - 0.5, hi + 0.5);
    }
    (lo, hi)
}

fn fmt_num(v: f64) -> String {
    if v != 0.0 && (v.abs() < 1e-3 || v.abs() >= 1e5) {
        format!("{v:.2e}")
    } else {
        format!("{v:.3}")
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_series() {
        let svg = render(
            "loss",
            &[
                Series { name: "main/loss", points: vec![(1.0, 2.0), (2.0, 1.0)] },
                Series { name: "validation/main/loss", points: vec![] },
            ],
        );
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("main/loss"));
        assert_eq!(svg.matches("<polyline").count(), 2);
    }

    #[test]
    fn test_degenerate_bounds() {
        assert_eq!(bounds(std::iter::empty()), (0.0, 1.0));
        assert_eq!(bounds([3.0, 3.0].into_iter()), (2.5, 3.5));
        let svg = render("x", &[Series { name: "a", points: vec![(1.0, f64::NAN)] }]);
        assert!(!svg.contains("NaN"));
    }
}

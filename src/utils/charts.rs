//! SVG Chart Generator for training history
//!
//! Renders the run's accuracy and loss curves side by side (train vs
//! validation), with a dashed marker where fine-tuning begins.

use std::path::Path;

use crate::training::TrainingHistory;
use crate::utils::error::Result;

/// Chart styling constants
const PANEL_WIDTH: f64 = 600.0;
const CHART_HEIGHT: f64 = 450.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 70.0;

const COLOR_TRAIN: &str = "#3498db";
const COLOR_VAL: &str = "#e67e22";
const COLOR_BOUNDARY: &str = "#e74c3c";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// A data series for charts
#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    /// (epoch, value)
    pub points: Vec<(f64, f64)>,
    pub color: String,
}

/// How the y axis of a panel is labeled and bounded
#[derive(Debug, Clone, Copy)]
enum Scale {
    /// [0, 1] shown as percentages
    Fraction,
    /// [0, max] shown as raw values
    Loss,
}

struct Panel<'a> {
    title: &'a str,
    y_label: &'a str,
    scale: Scale,
    series: Vec<DataSeries>,
}

/// Render the history chart as an SVG document
pub fn render_history_svg(history: &TrainingHistory) -> String {
    let epochs: Vec<f64> = history.epochs.iter().map(|r| r.global_epoch as f64).collect();
    let series = |name: &str, color: &str, value: &dyn Fn(usize) -> f64| DataSeries {
        name: name.to_string(),
        points: epochs.iter().enumerate().map(|(i, &x)| (x, value(i))).collect(),
        color: color.to_string(),
    };

    let accuracy = Panel {
        title: "Model Accuracy",
        y_label: "Accuracy",
        scale: Scale::Fraction,
        series: vec![
            series("Train", COLOR_TRAIN, &|i| history.epochs[i].train_accuracy),
            series("Validation", COLOR_VAL, &|i| history.epochs[i].val_accuracy),
        ],
    };
    let loss = Panel {
        title: "Model Loss",
        y_label: "Loss",
        scale: Scale::Loss,
        series: vec![
            series("Train", COLOR_TRAIN, &|i| history.epochs[i].train_loss),
            series("Validation", COLOR_VAL, &|i| history.epochs[i].val_loss),
        ],
    };

    let boundary = history.phase_boundary().map(|b| b as f64 + 0.5);
    let width = PANEL_WIDTH * 2.0;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        width, CHART_HEIGHT, width, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        width, CHART_HEIGHT
    ));

    draw_panel(&mut svg, &accuracy, 0.0, boundary);
    draw_panel(&mut svg, &loss, PANEL_WIDTH, boundary);

    svg.push_str("</svg>");
    svg
}

/// Write the history chart to `path`
pub fn write_history_chart(history: &TrainingHistory, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, render_history_svg(history))?;
    Ok(())
}

fn draw_panel(svg: &mut String, panel: &Panel<'_>, offset_x: f64, boundary: Option<f64>) {
    let plot_width = PANEL_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let left = offset_x + MARGIN_LEFT;
    let bottom = MARGIN_TOP + plot_height;

    let (x_min, x_max, _, y_data_max) = find_ranges(&panel.series);
    let (x_min, x_max) = if !x_min.is_finite() {
        (0.0, 1.0)
    } else if x_max > x_min {
        (x_min, x_max)
    } else {
        (x_min - 1.0, x_max + 1.0)
    };
    let y_max = match panel.scale {
        Scale::Fraction => 1.0,
        Scale::Loss if y_data_max.is_finite() && y_data_max > 0.0 => y_data_max * 1.1,
        Scale::Loss => 1.0,
    };

    let to_x = |x: f64| left + (x - x_min) / (x_max - x_min) * plot_width;
    let to_y = |y: f64| bottom - (y.clamp(0.0, y_max) / y_max) * plot_height;

    // Title
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        offset_x + PANEL_WIDTH / 2.0, COLOR_TEXT, escape_xml(panel.title)
    ));

    // Grid lines
    for i in 0..=5 {
        let fraction = i as f64 / 5.0;
        let y = bottom - fraction * plot_height;
        let label = match panel.scale {
            Scale::Fraction => format!("{:.0}%", fraction * 100.0),
            Scale::Loss => format!("{:.2}", fraction * y_max),
        };
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            left, y, left + plot_width, y, COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            left - 10.0, y + 4.0, COLOR_TEXT, label
        ));
    }

    // Axes
    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        left, bottom, left + plot_width, bottom, COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        left, MARGIN_TOP, left, bottom, COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Epoch</text>"#,
        left + plot_width / 2.0, CHART_HEIGHT - 20.0, COLOR_TEXT
    ));
    let y_label_x = offset_x + 20.0;
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 {} {})">{}</text>"#,
        y_label_x, CHART_HEIGHT / 2.0, COLOR_TEXT, y_label_x, CHART_HEIGHT / 2.0, escape_xml(panel.y_label)
    ));

    // Fine-tuning marker
    if let Some(b) = boundary {
        let x = to_x(b);
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2" stroke-dasharray="6,4"/>"#,
            x, MARGIN_TOP, x, bottom, COLOR_BOUNDARY
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="11" fill="{}">Start Fine Tuning</text>"#,
            x + 5.0, MARGIN_TOP + 14.0, COLOR_BOUNDARY
        ));
    }

    // Series
    for series in &panel.series {
        if series.points.is_empty() {
            continue;
        }
        let path: Vec<String> = series
            .points
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                let cmd = if i == 0 { "M" } else { "L" };
                format!("{} {:.1} {:.1}", cmd, to_x(x), to_y(y))
            })
            .collect();
        svg.push_str(&format!(
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="2.5"/>"#,
            path.join(" "),
            series.color
        ));
        for &(x, y) in &series.points {
            svg.push_str(&format!(
                r#"<circle cx="{:.1}" cy="{:.1}" r="3" fill="{}"/>"#,
                to_x(x),
                to_y(y),
                series.color
            ));
        }
    }

    // Legend
    let mut legend_y = MARGIN_TOP + 10.0;
    for series in &panel.series {
        let legend_x = offset_x + PANEL_WIDTH - MARGIN_RIGHT - 110.0;
        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="15" height="15" fill="{}"/>"#,
            legend_x, legend_y, series.color
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            legend_x + 20.0, legend_y + 12.0, COLOR_TEXT, escape_xml(&series.name)
        ));
        legend_y += 22.0;
    }
}

fn find_ranges(series: &[DataSeries]) -> (f64, f64, f64, f64) {
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;

    for s in series {
        for &(x, y) in &s.points {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
    }

    (x_min, x_max, y_min, y_max)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

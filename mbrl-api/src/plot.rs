use crate::logger::DataLog;
use anyhow::Result;
use std::{fmt::Write as _, path::Path};

pub const PLOT_FILE: &str = "training_curves.svg";

const PANEL_WIDTH: f32 = 480.;
const PANEL_HEIGHT: f32 = 200.;
const MARGIN: f32 = 50.;

/// Renders one panel per key in `keys`, plotted against the running sum of `sample_key`, and
/// writes it to `<dir>/training_curves.svg`. Keys that were never logged are skipped.
pub fn make_train_plots(log: &DataLog, keys: &[&str], sample_key: &str, dir: &Path) -> Result<()> {
    let samples: Vec<f32> = log
        .get(sample_key)
        .into_iter()
        .scan(0., |total, value| {
            *total += value.unwrap_or(0.);
            Some(*total)
        })
        .collect();

    let panels: Vec<(&str, Vec<(f32, f32)>)> = keys
        .iter()
        .filter_map(|key| {
            let points: Vec<(f32, f32)> = log
                .get(key)
                .into_iter()
                .zip(&samples)
                .filter_map(|(value, x)| value.filter(|v| v.is_finite()).map(|v| (*x, v)))
                .collect();
            (!points.is_empty()).then_some((*key, points))
        })
        .collect();

    let width = PANEL_WIDTH + 2. * MARGIN;
    let height = (panels.len().max(1) as f32) * (PANEL_HEIGHT + 2. * MARGIN);
    let mut svg = String::new();
    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" font-family="sans-serif" font-size="12">"#
    )?;
    writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;
    for (idx, (key, points)) in panels.iter().enumerate() {
        let top = idx as f32 * (PANEL_HEIGHT + 2. * MARGIN) + MARGIN;
        render_panel(&mut svg, key, sample_key, points, top)?;
    }
    writeln!(svg, "</svg>")?;
    std::fs::write(dir.join(PLOT_FILE), svg)?;
    Ok(())
}

fn bounds(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let (lo, hi) = values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if hi - lo < 1e-6 {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

fn render_panel(
    svg: &mut String,
    key: &str,
    x_label: &str,
    points: &[(f32, f32)],
    top: f32,
) -> Result<()> {
    let (x_lo, x_hi) = bounds(points.iter().map(|(x, _)| *x));
    let (y_lo, y_hi) = bounds(points.iter().map(|(_, y)| *y));
    let to_x = |x: f32| MARGIN + (x - x_lo) / (x_hi - x_lo) * PANEL_WIDTH;
    let to_y = |y: f32| top + PANEL_HEIGHT - (y - y_lo) / (y_hi - y_lo) * PANEL_HEIGHT;

    writeln!(
        svg,
        r#"<rect x="{MARGIN}" y="{top}" width="{PANEL_WIDTH}" height="{PANEL_HEIGHT}" fill="none" stroke="black"/>"#
    )?;
    writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle">{key}</text>"#,
        MARGIN + PANEL_WIDTH / 2.,
        top - 10.
    )?;
    writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle">{x_label}</text>"#,
        MARGIN + PANEL_WIDTH / 2.,
        top + PANEL_HEIGHT + 35.
    )?;
    for (value, y) in [(y_hi, top + 4.), (y_lo, top + PANEL_HEIGHT)] {
        writeln!(
            svg,
            r#"<text x="{}" y="{y}" text-anchor="end">{value:.3}</text>"#,
            MARGIN - 4.
        )?;
    }
    for (value, anchor, x) in [
        (x_lo, "start", MARGIN),
        (x_hi, "end", MARGIN + PANEL_WIDTH),
    ] {
        writeln!(
            svg,
            r#"<text x="{x}" y="{}" text-anchor="{anchor}">{value:.0}</text>"#,
            top + PANEL_HEIGHT + 15.
        )?;
    }

    let polyline = points
        .iter()
        .map(|(x, y)| format!("{:.2},{:.2}", to_x(*x), to_y(*y)))
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(
        svg,
        r#"<polyline points="{polyline}" fill="none" stroke="steelblue" stroke-width="2"/>"#
    )?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_panel_per_logged_key() -> Result<()> {
        let mut log = DataLog::new();
        for iter in 0..3 {
            log.new_row();
            log.log_kv("iter_samples", 100.);
            log.log_kv("rollout_score", iter as f32);
        }
        let dir = tempfile::tempdir()?;
        make_train_plots(&log, &["rollout_score", "eval_score"], "iter_samples", dir.path())?;
        let svg = std::fs::read_to_string(dir.path().join(PLOT_FILE))?;
        assert!(svg.starts_with("<svg"));
        assert_eq!(svg.matches("<polyline").count(), 1);
        assert!(svg.contains(">rollout_score</text>"));
        assert!(!svg.contains("eval_score"));
        Ok(())
    }
}

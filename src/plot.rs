//! SVG figures for the report.

use std::path::Path;

use anyhow::Result;
use plotters::prelude::*;

use crate::describe::Histogram;
use crate::models::KaplanMeier;
use crate::predict::ProfilePrediction;

const SIZE: (u32, u32) = (900, 540);
const COLORS: [RGBColor; 6] = [
    RGBColor(31, 119, 180),
    RGBColor(214, 39, 40),
    RGBColor(44, 160, 44),
    RGBColor(255, 127, 14),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
];

fn color(i: usize) -> RGBColor {
    COLORS[i % COLORS.len()]
}

pub fn plot_histogram(hist: &Histogram, path: &Path) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let (x_min, x_max) = match (hist.edges.first(), hist.edges.last()) {
        (Some(&a), Some(&b)) => (a, b),
        _ => (0.0, 1.0),
    };
    let y_max = hist.counts.iter().copied().max().unwrap_or(0).max(1) as f64 * 1.05;
    let mut chart = ChartBuilder::on(&root)
        .caption(format!("Histogram of {}", hist.variable), ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, 0f64..y_max)?;
    chart
        .configure_mesh()
        .x_desc(hist.variable.as_str())
        .y_desc("count")
        .draw()?;
    let fill = color(0).mix(0.6).filled();
    chart.draw_series(hist.counts.iter().enumerate().map(|(k, &n)| {
        Rectangle::new([(hist.edges[k], 0.0), (hist.edges[k + 1], n as f64)], fill)
    }))?;
    root.present()?;
    Ok(())
}

/// Right-continuous step points of a KM curve, starting at (0, 1).
fn km_steps(km: &KaplanMeier) -> Vec<(f64, f64)> {
    let mut pts = vec![(0.0, 1.0)];
    let mut last = 1.0;
    for s in &km.steps {
        pts.push((s.time, last));
        pts.push((s.time, s.survival));
        last = s.survival;
    }
    pts
}

pub fn plot_kaplan_meier(curves: &[KaplanMeier], title: &str, path: &Path) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let t_max = curves
        .iter()
        .flat_map(|c| c.steps.iter().map(|s| s.time))
        .fold(1.0_f64, f64::max);
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..t_max, 0f64..1.0)?;
    chart
        .configure_mesh()
        .x_desc("days since randomisation")
        .y_desc("proportion seizure free")
        .draw()?;
    for (i, km) in curves.iter().enumerate() {
        let c = color(i);
        chart
            .draw_series(LineSeries::new(km_steps(km), c.stroke_width(2)))?
            .label(format!("{} (n={})", km.label, km.n))
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], c));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// Predicted time against failure probability, one curve per profile with
/// its +/- 2 SE band.
pub fn plot_quantiles(predictions: &[ProfilePrediction], title: &str, path: &Path) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let t_max = predictions
        .iter()
        .flat_map(|p| p.quantiles.iter().map(|q| q.upper))
        .filter(|v| v.is_finite())
        .fold(1.0_f64, f64::max);
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20).into_font())
        .margin(10)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..1.0, 0f64..t_max)?;
    chart
        .configure_mesh()
        .x_desc("probability of a seizure")
        .y_desc("predicted days")
        .draw()?;
    for (i, pred) in predictions.iter().enumerate() {
        let c = color(i);
        let est: Vec<(f64, f64)> = pred.quantiles.iter().map(|q| (q.p, q.time)).collect();
        let lower: Vec<(f64, f64)> = pred.quantiles.iter().map(|q| (q.p, q.lower.min(t_max))).collect();
        let upper: Vec<(f64, f64)> = pred.quantiles.iter().map(|q| (q.p, q.upper.min(t_max))).collect();
        chart
            .draw_series(LineSeries::new(est, c.stroke_width(2)))?
            .label(pred.profile.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], c));
        chart.draw_series(LineSeries::new(lower, c.mix(0.5)))?;
        chart.draw_series(LineSeries::new(upper, c.mix(0.5)))?;
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_km_steps_start_at_one() {
        let km = KaplanMeier::fit("all", &[2.0, 4.0], &[1, 1]);
        let pts = km_steps(&km);
        assert_eq!(pts[0], (0.0, 1.0));
        assert_eq!(pts[1], (2.0, 1.0));
        assert_eq!(pts[2], (2.0, 0.5));
        assert_eq!(pts.last(), Some(&(4.0, 0.0)));
    }

    #[test]
    fn test_plots_write_svg_files() -> Result<()> {
        let dir = tempdir()?;
        let hist = Histogram::new("age", &[10.0, 20.0, 25.0, 40.0, f64::NAN], 4);
        let h = dir.path().join("age.svg");
        plot_histogram(&hist, &h)?;
        let km = KaplanMeier::fit("immediate", &[2.0, 4.0, 9.0], &[1, 0, 1]);
        let k = dir.path().join("km.svg");
        plot_kaplan_meier(&[km], "Time to first seizure", &k)?;
        for path in [h, k] {
            let svg = std::fs::read_to_string(&path)?;
            assert!(svg.starts_with("<svg"), "{}", path.display());
        }
        Ok(())
    }
}

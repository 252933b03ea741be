//! Charts for inspecting the data and training runs

use std::error::Error;

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    prelude::{BitMapBackend, Circle, IntoDrawingArea, PathElement, Rectangle},
    series::LineSeries,
    style::{BLACK, Color, Palette, Palette99, RGBColor, WHITE},
};

use crate::models::IMAGE_SIDE;

/// Plots one validation loss curve per training run, with the (zero based) epoch on the x axis
pub fn plot_losses(runs: &[(&str, &[f32])], file_name: &str, title: &str) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let n_epochs = runs.iter().map(|(_, l)| l.len()).max().unwrap_or(0).max(1);
    let finite = || runs.iter().flat_map(|(_, l)| l.iter().copied()).filter(|l| l.is_finite());
    let y_max = finite().fold(0.0f32, f32::max).max(1e-3) * 1.1;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(title, ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0usize..n_epochs, 0.0f32..y_max)?;

    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("validation loss")
        .draw()?;

    for (i, (name, losses)) in runs.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(
                losses.iter().enumerate().map(|(epoch, &l)| (epoch, l)),
                color,
            ))?
            .label(*name)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        chart.draw_series(
            losses
                .iter()
                .enumerate()
                .map(|(epoch, &l)| Circle::new((epoch, l), 3, color.filled())),
        )?;
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss plot has been saved to '{}'.", file_name);
    Ok(())
}

/// Draws a single flattened 28x28 image in grey scale, pixel values in `[0, 1]`
pub fn plot_image(pixels: &[f32], file_name: &str, title: &str) -> Result<(), Box<dyn Error>> {
    if pixels.len() != IMAGE_SIDE * IMAGE_SIDE {
        return Err(format!("expected {} pixels, got {}", IMAGE_SIDE * IMAGE_SIDE, pixels.len()).into());
    }
    let root_area = BitMapBackend::new(file_name, (320, 340)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let side = IMAGE_SIDE as i32;
    let mut chart = ChartBuilder::on(&root_area)
        .caption(title, ("sans-serif", 20))
        .margin(10)
        .build_cartesian_2d(0..side, 0..side)?;

    chart.draw_series(pixels.iter().enumerate().map(|(i, &p)| {
        // first row at the top
        let (row, col) = (side - 1 - (i / IMAGE_SIDE) as i32, (i % IMAGE_SIDE) as i32);
        let level = 255 - (p.clamp(0.0, 1.0) * 255.0) as u8;
        Rectangle::new(
            [(col, row), (col + 1, row + 1)],
            RGBColor(level, level, level).filled(),
        )
    }))?;

    root_area.present()?;
    log::info!("Image has been saved to '{}'.", file_name);
    Ok(())
}

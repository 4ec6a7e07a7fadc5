use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn write_text(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

/// Writes a headed CSV with one point per `(x, y, z, classification)` tuple.
pub fn write_points(dir: &Path, name: &str, points: &[(f64, f64, f64, u8)]) -> PathBuf {
    let mut contents = String::from("x,y,z,classification,gps_time\n");
    for (i, (x, y, z, class)) in points.iter().enumerate() {
        contents.push_str(&format!("{},{},{},{},{}\n", x, y, z, class, i));
    }
    write_text(dir, name, &contents)
}

/// A `side` by `side` grid of points spaced `step` apart starting at `origin`.
pub fn grid_points(origin: (f64, f64), side: usize, step: f64) -> Vec<(f64, f64, f64, u8)> {
    let mut points = Vec::with_capacity(side * side);
    for row in 0..side {
        for col in 0..side {
            let class = if (row + col) % 2 == 0 { 2 } else { 6 };
            points.push((
                origin.0 + col as f64 * step,
                origin.1 + row as f64 * step,
                (row * side + col) as f64 * 0.5,
                class,
            ));
        }
    }
    points
}

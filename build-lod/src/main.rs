use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::Context;
use glam::Vec3;

use splat_lod::splat::{decode, read_raw_splats, recenter};
use splat_lod::{
    Camera, GridHcParams, HcParams, Hierarchy, HierarchyConfig, MetricWeights, OctreeParams, RawSplat,
};

const DEFAULT_EYE: [f32; 3] = [0.0, 0.0, 10.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildLodKind {
    Hc,
    Octree,
    GridHc,
}

#[derive(Clone, Debug, Default)]
struct BuildLodOptions {
    kind: Option<BuildLodKind>,
    config: Option<HierarchyConfig>,
    max_error: Option<f32>,
    max_depth: Option<u32>,
    min_splats: Option<usize>,
    grid: Option<u32>,
    recenter: bool,
    limit: Option<usize>,
    depth: Option<u32>,
    threshold: Option<f32>,
    camera: Option<[f32; 3]>,
}

impl BuildLodOptions {
    fn resolve_config(&self) -> HierarchyConfig {
        let mut config = self.config.unwrap_or_default();
        if let Some(kind) = self.kind {
            let selected = match kind {
                BuildLodKind::Hc => HierarchyConfig::Hc(HcParams::default()),
                BuildLodKind::Octree => HierarchyConfig::Octree(OctreeParams::default()),
                BuildLodKind::GridHc => HierarchyConfig::GridHc(GridHcParams::default()),
            };
            // Builder flags keep --config parameters of the same kind
            if selected.kind() != config.kind() {
                config = selected;
            }
        }

        match &mut config {
            HierarchyConfig::Hc(params) => {
                if self.max_error.is_some() {
                    params.max_error = self.max_error;
                }
            }
            HierarchyConfig::GridHc(params) => {
                if self.max_error.is_some() {
                    params.hc.max_error = self.max_error;
                }
                if let Some(grid) = self.grid {
                    params.subdivisions = [grid; 3];
                }
            }
            HierarchyConfig::Octree(params) => {
                if let Some(max_depth) = self.max_depth {
                    params.max_depth = max_depth;
                }
                if let Some(min_splats) = self.min_splats {
                    params.max_splats_per_node = min_splats;
                }
            }
        }
        config
    }
}

fn seconds(duration: std::time::Duration) -> serde_json::Value {
    serde_json::Number::from_f64(duration.as_secs_f64()).map_or(serde_json::Value::Null, Into::into)
}

fn process_file_lod(filename: &str, options: &BuildLodOptions, config: &HierarchyConfig) -> anyhow::Result<()> {
    let bytes = std::fs::read(filename).with_context(|| format!("reading {}", filename))?;
    if bytes.len() % RawSplat::SIZE != 0 {
        eprintln!("Ignoring {} trailing bytes in {}", bytes.len() % RawSplat::SIZE, filename);
    }

    let mut raws = read_raw_splats(&bytes);
    let mut description = serde_json::Map::new();
    let input_splat_count = raws.len();
    println!("Read: num_splats: {}", input_splat_count);
    description.insert("input_splat_count".to_string(), input_splat_count.into());

    if let Some(limit) = options.limit {
        if raws.len() > limit {
            raws.truncate(limit);
            println!("Truncated to {} splats", limit);
            description.insert("limit".to_string(), limit.into());
        }
    }

    let mut splits: Vec<_> = raws.iter().map(decode).collect();

    let mut invalid_count = 0;
    for (index, split) in splits.iter().enumerate() {
        if !split.position.is_finite() || !split.scale.is_finite() {
            if invalid_count < 100 {
                eprintln!("Splat {} not finite: {:?}", index, split);
            }
            invalid_count += 1;
        }
    }
    if invalid_count > 0 {
        anyhow::bail!("found {} invalid splats", invalid_count);
    }

    if options.recenter {
        recenter(&mut splits);
        description.insert("recenter".to_string(), true.into());
    }

    description.insert("config".to_string(), serde_json::to_value(config)?);

    let start_time = std::time::Instant::now();
    let hierarchy = Hierarchy::build(config, &splits).with_context(|| format!("building {} hierarchy", config.kind()))?;
    let build_duration = start_time.elapsed();

    let stats = hierarchy.stats();
    println!("Built {} hierarchy: {} splats, {} roots in {:.3}s", stats.kind, stats.num_splats, stats.num_roots, build_duration.as_secs_f64());
    description.insert("build_duration".to_string(), seconds(build_duration));
    description.insert("stats".to_string(), serde_json::to_value(&stats)?);

    if let Some(depth) = options.depth {
        let start_time = std::time::Instant::now();
        let count = hierarchy.get_indices_depth(depth).len();
        println!("Depth {} cut: {} splats", depth, count);
        description.insert("depth_query".to_string(), serde_json::json!({
            "depth": depth,
            "count": count,
            "duration": seconds(start_time.elapsed()),
        }));
    }

    if let Some(threshold) = options.threshold {
        let eye = options.camera.unwrap_or(DEFAULT_EYE);
        let camera = Camera::look_at(Vec3::from_array(eye), Vec3::ZERO, Vec3::Y);
        let start_time = std::time::Instant::now();
        let count = hierarchy.get_indices(&camera, threshold, &MetricWeights::default()).len();
        println!("Threshold {} cut from {:?}: {} splats", threshold, eye, count);
        description.insert("camera_query".to_string(), serde_json::json!({
            "camera": eye,
            "threshold": threshold,
            "count": count,
            "duration": seconds(start_time.elapsed()),
        }));
    }

    let description = serde_json::Value::Object(description);
    println!("{}", serde_json::to_string_pretty(&description)?);

    let mut output_filename = filename.to_string();
    if let Some(dot) = filename.rfind('.') {
        output_filename.replace_range(dot.., "-lod");
    } else {
        output_filename.push_str("-lod");
    }
    let filename_ext = format!("{}.json", output_filename);
    let mut writer = BufWriter::new(File::create(&filename_ext).with_context(|| format!("creating {}", filename_ext))?);
    serde_json::to_writer_pretty(&mut writer, &description)?;
    writer.flush()?;
    println!("Wrote {}", filename_ext);
    Ok(())
}

fn load_config(filename: &str) -> anyhow::Result<HierarchyConfig> {
    let file = File::open(filename).with_context(|| format!("opening {}", filename))?;
    let config: HierarchyConfig = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing {}", filename))?;
    Ok(config)
}

fn parse_vec3(value: &str) -> Option<[f32; 3]> {
    let values = value.split(',').map(|v| v.trim().parse::<f32>()).collect::<Result<Vec<f32>, _>>().ok()?;
    match values.as_slice() {
        &[x, y, z] => Some([x, y, z]),
        _ => None,
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    match value.parse::<T>() {
        Ok(v) => {
            println!("Using {}{}", flag, value);
            v
        }
        Err(_) => {
            eprintln!("Invalid {} value: {}", flag.trim_end_matches('='), value);
            show_usage_exit()
        }
    }
}

fn show_usage_exit() -> ! {
    eprintln!("Usage: build-lod");
    eprintln!("  [--hc] [--octree] [--grid-hc]        // Hierarchy builder (default grid-hc)");
    eprintln!("  [--config=<file.json>]               // Load hierarchy parameters, e.g. {{\"type\": \"octree\", \"max_depth\": 8}}");
    eprintln!("  [--max-error=<f>]                    // Merge cost ceiling for hc and grid-hc (default unbounded)");
    eprintln!("  [--max-depth=<n>]                    // Octree depth limit (default 10)");
    eprintln!("  [--min-splats=<n>]                   // Octree splats per leaf before splitting stops (default 1)");
    eprintln!("  [--grid=<n>]                         // Grid-hc cells per axis (default 20)");
    eprintln!("  [--recenter]                         // Move the mean splat position to the origin");
    eprintln!("  [--limit=<n>]                        // Only use the first <n> splats");
    eprintln!("  [--depth=<n>]                        // Report the size of a depth cut");
    eprintln!("  [--threshold=<f>]                    // Report the size of a camera cut at this threshold");
    eprintln!("  [--camera=<x>,<y>,<z>]               // Camera position for --threshold, looking at the origin (default 0,0,10)");
    eprintln!("  <file.splat> [...]                   // Multiple input files allowed");
    std::process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut options = BuildLodOptions::default();
    let mut filenames = Vec::new();

    for arg in args {
        match arg.as_str() {
            "--hc" => {
                options.kind = Some(BuildLodKind::Hc);
                println!("Using --hc: Agglomerative hierarchy over all splats");
                continue;
            }
            "--octree" => {
                options.kind = Some(BuildLodKind::Octree);
                println!("Using --octree: Octree hierarchy");
                continue;
            }
            "--grid-hc" => {
                options.kind = Some(BuildLodKind::GridHc);
                println!("Using --grid-hc: Agglomerative hierarchy per grid cell");
                continue;
            }
            "--recenter" => {
                options.recenter = true;
                println!("Using --recenter");
                continue;
            }
            _ => {}
        }
        if let Some(rest) = arg.strip_prefix("--config=") {
            match load_config(rest) {
                Ok(config) => {
                    println!("Using --config={}: {:?}", rest, config);
                    options.config = Some(config);
                }
                Err(error) => {
                    eprintln!("Invalid --config: {:?}", error);
                    show_usage_exit();
                }
            }
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--max-error=") {
            options.max_error = Some(parse_value("--max-error=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--max-depth=") {
            options.max_depth = Some(parse_value("--max-depth=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--min-splats=") {
            options.min_splats = Some(parse_value("--min-splats=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--grid=") {
            options.grid = Some(parse_value("--grid=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--limit=") {
            options.limit = Some(parse_value("--limit=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--depth=") {
            options.depth = Some(parse_value("--depth=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--threshold=") {
            options.threshold = Some(parse_value("--threshold=", rest));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("--camera=") {
            match parse_vec3(rest) {
                Some(eye) if eye.iter().all(|v| v.is_finite()) && eye != [0.0; 3] => {
                    options.camera = Some(eye);
                    println!("Using --camera={:?}", eye);
                }
                _ => {
                    eprintln!("Invalid --camera value: {}", rest);
                    show_usage_exit();
                }
            }
            continue;
        }
        if arg.starts_with("--") {
            eprintln!("Unknown option: {}", arg);
            show_usage_exit();
        }
        filenames.push(arg);
    }

    if filenames.is_empty() {
        show_usage_exit();
    }

    let config = options.resolve_config();
    if let Err(error) = config.validate() {
        eprintln!("{}", error);
        show_usage_exit();
    }

    for filename in filenames {
        println!("*** Processing: {}", filename);
        if let Err(error) = process_file_lod(&filename, &options, &config) {
            eprintln!("Failed to process {}: {:?}", filename, error);
        }
    }
}

//! Read-only dashboard over a sample CSV.
//!
//! `GET /` renders SVG line charts for GPU memory, GPU utilization, CPU and
//! memory usage; `GET /api/samples` returns the table as JSON. The CSV is
//! re-read on every request, so a dashboard pointed at a running monitor's
//! log follows it as it is flushed.

use std::path::{Path, PathBuf};

/// A CSV log loaded into memory, columns in file order.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SampleTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SampleTable {
    pub fn load(path: &Path) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let columns = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<Result<_, _>>()?;
        Ok(Self { columns, rows })
    }

    /// Numeric values of one column; empty or non-numeric cells become `None`.
    pub fn series(&self, column: &str) -> Vec<Option<f64>> {
        let Some(idx) = self.columns.iter().position(|c| c == column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .map(|row| row.get(idx).and_then(|v| v.trim().parse::<f64>().ok()))
            .collect()
    }

    fn series_text(&self, column: &str) -> Vec<&str> {
        let Some(idx) = self.columns.iter().position(|c| c == column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).map(String::as_str))
            .collect()
    }

    fn columns_matching(&self, pred: impl Fn(&str) -> bool) -> Vec<&str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|&c| pred(c))
            .collect()
    }
}

const CHART_WIDTH: f64 = 720.0;
const CHART_HEIGHT: f64 = 220.0;
const PALETTE: [&str; 6] = ["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b"];

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One SVG line chart. X is the sample index; Y is scaled to the largest value.
pub fn render_chart(title: &str, series: &[(&str, Vec<Option<f64>>)]) -> String {
    let len = series.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
    let max = series
        .iter()
        .flat_map(|(_, s)| s.iter().flatten())
        .fold(0.0_f64, |acc, v| acc.max(*v));
    let y_scale = if max > 0.0 { CHART_HEIGHT / max } else { 0.0 };
    let x_step = if len > 1 {
        CHART_WIDTH / (len - 1) as f64
    } else {
        0.0
    };

    let mut svg = format!(
        "<h2>{}</h2>\n<svg width=\"{w}\" height=\"{h}\" viewBox=\"0 -10 {w} {h2}\">\n\
         <rect x=\"0\" y=\"0\" width=\"{w}\" height=\"{h}\" fill=\"none\" stroke=\"#ccc\"/>\n",
        escape(title),
        w = CHART_WIDTH,
        h = CHART_HEIGHT,
        h2 = CHART_HEIGHT + 20.0,
    );

    for (i, (name, values)) in series.iter().enumerate() {
        let points: Vec<String> = values
            .iter()
            .enumerate()
            .filter_map(|(x, v)| {
                v.map(|v| format!("{:.1},{:.1}", x as f64 * x_step, CHART_HEIGHT - v * y_scale))
            })
            .collect();
        let color = PALETTE[i % PALETTE.len()];
        svg.push_str(&format!(
            "<polyline fill=\"none\" stroke=\"{color}\" stroke-width=\"1.5\" points=\"{}\"><title>{}</title></polyline>\n",
            points.join(" "),
            escape(name),
        ));
    }
    svg.push_str(&format!(
        "<text x=\"4\" y=\"0\" font-size=\"10\">max {max}</text>\n</svg>\n"
    ));

    let legend: Vec<String> = series
        .iter()
        .enumerate()
        .map(|(i, (name, _))| {
            format!(
                "<span style=\"color:{}\">&#9632; {}</span>",
                PALETTE[i % PALETTE.len()],
                escape(name)
            )
        })
        .collect();
    svg.push_str(&format!("<p>{}</p>\n", legend.join(" ")));
    svg
}

/// The full dashboard page for a table.
pub fn render_page(source: &Path, table: &SampleTable) -> String {
    let groups: [(&str, Vec<&str>); 4] = [
        (
            "GPU Memory Utilization",
            table.columns_matching(|c| c.starts_with("gpu_") && c.ends_with("_memory_used")),
        ),
        (
            "GPU Utilization",
            table.columns_matching(|c| c.starts_with("gpu_") && c.ends_with("_utilization_gpu")),
        ),
        ("CPU Usage", table.columns_matching(|c| c == "cpu_usage")),
        (
            "Memory Usage",
            table.columns_matching(|c| c.starts_with("memory_usage_") || c == "shared_memory"),
        ),
    ];

    let mut body = String::new();
    for (title, columns) in groups {
        if columns.is_empty() {
            continue;
        }
        let series: Vec<(&str, Vec<Option<f64>>)> =
            columns.iter().map(|c| (*c, table.series(c))).collect();
        body.push_str(&render_chart(title, &series));
    }

    let timestamps = table.series_text("timestamp");
    let span = match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => format!("{} &ndash; {}", escape(first), escape(last)),
        _ => "no samples".to_string(),
    };

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>gpu-monitor</title></head>\n\
         <body style=\"font-family:sans-serif\">\n<h1>{}</h1>\n<p>{} samples, {span}</p>\n{body}</body></html>\n",
        escape(&source.display().to_string()),
        table.rows.len(),
    )
}

#[derive(Clone)]
struct AppState {
    csv_path: PathBuf,
}

pub fn router(csv_path: PathBuf) -> axum::Router {
    use axum::routing::get;
    use tower_http::cors::CorsLayer;

    axum::Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/samples", get(api_samples))
        .with_state(AppState { csv_path })
        .layer(CorsLayer::permissive())
}

/// Serve the dashboard until the process is stopped.
pub async fn run(
    csv_path: PathBuf,
    bind: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(csv_path.clone());
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(csv = %csv_path.display(), "dashboard listening on http://{local_addr}");
    println!("Dashboard for {} at http://{local_addr}", csv_path.display());

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"ok": true}))
}

fn load_for_request(path: &Path) -> Result<SampleTable, (axum::http::StatusCode, String)> {
    use axum::http::StatusCode;

    if !path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no sample log at {}", path.display()),
        ));
    }
    SampleTable::load(path).map_err(|e| {
        tracing::warn!(error = %e, path = %path.display(), "failed to read sample log");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read {}: {e}", path.display()))
    })
}

async fn api_samples(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::Json<SampleTable>, (axum::http::StatusCode, String)> {
    load_for_request(&state.csv_path).map(axum::Json)
}

async fn index(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::response::Html<String>, (axum::http::StatusCode, String)> {
    let table = load_for_request(&state.csv_path)?;
    Ok(axum::response::Html(render_page(&state.csv_path, &table)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LOG: &str = "\
gpu_0_timestamp,gpu_0_name,gpu_0_memory_total,gpu_0_memory_used,gpu_0_utilization_gpu,cpu_usage,memory_usage_rss,memory_usage_pss,memory_usage_uss,shared_memory,timestamp
t0,A100,40960,100,10,0,1000,900,800,100,2024-05-01 12:00:00.000000
t1,A100,40960,200,[N/A],50,2000,1800,1600,200,2024-05-01 12:00:01.000000
t2,A100,40960,300,30,100,3000,2700,2400,300,2024-05-01 12:00:02.000000
";

    fn write_log(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("gpu_logs.csv");
        std::fs::write(&path, LOG).unwrap();
        path
    }

    #[test]
    fn test_load_table() {
        let dir = tempdir().unwrap();
        let table = SampleTable::load(&write_log(&dir)).unwrap();
        assert_eq!(table.columns.len(), 11);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.columns[5], "cpu_usage");
    }

    #[test]
    fn test_series_skips_non_numeric() {
        let dir = tempdir().unwrap();
        let table = SampleTable::load(&write_log(&dir)).unwrap();
        assert_eq!(
            table.series("gpu_0_utilization_gpu"),
            vec![Some(10.0), None, Some(30.0)]
        );
        assert!(table.series("gpu_7_memory_used").is_empty());
    }

    #[test]
    fn test_render_chart_scales_points() {
        let svg = render_chart(
            "CPU <Usage>",
            &[("cpu_usage", vec![Some(0.0), Some(50.0), Some(100.0)])],
        );
        assert!(svg.contains("CPU &lt;Usage&gt;"));
        assert!(svg.contains("points=\"0.0,220.0 360.0,110.0 720.0,0.0\""));
    }

    #[test]
    fn test_render_chart_empty_series() {
        let svg = render_chart("Empty", &[("cpu_usage", Vec::new())]);
        assert!(svg.contains("points=\"\""));
    }

    #[test]
    fn test_render_page_groups() {
        let dir = tempdir().unwrap();
        let path = write_log(&dir);
        let table = SampleTable::load(&path).unwrap();
        let html = render_page(&path, &table);
        for title in ["GPU Memory Utilization", "GPU Utilization", "CPU Usage", "Memory Usage"] {
            assert!(html.contains(title), "missing {title}");
        }
        assert!(html.contains("3 samples"));
        assert!(html.contains("shared_memory"));
    }

    #[test]
    fn test_render_page_without_gpu() {
        let table = SampleTable {
            columns: vec!["cpu_usage".to_string(), "timestamp".to_string()],
            rows: vec![vec!["1".to_string(), "t".to_string()]],
        };
        let html = render_page(Path::new("x.csv"), &table);
        assert!(!html.contains("GPU Utilization"));
        assert!(html.contains("CPU Usage"));
    }

    mod http {
        use super::*;
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
            let resp = app
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, String::from_utf8(bytes.to_vec()).unwrap())
        }

        #[tokio::test]
        async fn test_health() {
            let (status, body) = get(router(PathBuf::from("missing.csv")), "/api/health").await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.contains("\"ok\":true"));
        }

        #[tokio::test]
        async fn test_api_samples() {
            let dir = tempdir().unwrap();
            let (status, body) = get(router(write_log(&dir)), "/api/samples").await;
            assert_eq!(status, StatusCode::OK);
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["columns"][5], "cpu_usage");
            assert_eq!(json["rows"].as_array().unwrap().len(), 3);
        }

        #[tokio::test]
        async fn test_index_renders_html() {
            let dir = tempdir().unwrap();
            let (status, body) = get(router(write_log(&dir)), "/").await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.starts_with("<!DOCTYPE html>"));
            assert!(body.contains("<polyline"));
        }

        #[tokio::test]
        async fn test_missing_log_is_not_found() {
            let dir = tempdir().unwrap();
            let (status, body) = get(router(dir.path().join("nope.csv")), "/api/samples").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body.contains("no sample log"));
        }
    }
}

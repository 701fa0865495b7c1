//! OpenAPI schema generator
//!
//! Generates the OpenAPI JSON spec without starting the daemon or
//! touching external networks, so the schema can be frozen in the
//! repository for CI and client generation.

use dsmed::api::ApiDoc;
use utoipa::OpenApi;

fn main() {
    let openapi = ApiDoc::openapi();

    let json = serde_json::to_string_pretty(&openapi).expect("failed to serialize OpenAPI spec");

    let output_path = std::env::args().nth(1).unwrap_or_else(|| "openapi.json".to_string());

    std::fs::write(&output_path, json)
        .unwrap_or_else(|e| panic!("failed to write OpenAPI spec to {output_path}: {e}"));

    eprintln!("OpenAPI spec written to {output_path}");
}

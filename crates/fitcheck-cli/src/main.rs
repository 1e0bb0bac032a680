use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fitcheck_contracts::plan::{build_outfit_plan, PlanRequest, SlotPlan};
use fitcheck_contracts::tryon::{
    GarmentCategory, ResultImageReference, TryOnParams, VariantOutcome,
};
use fitcheck_engine::{extract_palette, EngineConfig, OutfitNarrator, TryOnEngine};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "fitcheck", version, about = "Virtual try-on and outfit planning CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    TryOn(TryOnArgs),
    Plan(PlanArgs),
    Palette(PaletteArgs),
}

#[derive(Debug, Parser)]
struct TryOnArgs {
    #[arg(long)]
    person: PathBuf,
    #[arg(long)]
    garment: PathBuf,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "upper_body")]
    category: String,
    #[arg(long, default_value_t = 30)]
    steps: u32,
    #[arg(long)]
    guidance: Option<f64>,
    /// Base seed; negative values randomize every variant.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    seed: i64,
    #[arg(long, default_value_t = 1)]
    variants: usize,
    #[arg(long)]
    no_crop: bool,
    #[arg(long)]
    no_fallback: bool,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long, default_value_t = 300)]
    budget: u32,
    #[arg(long, default_value = "casual")]
    occasion: String,
    #[arg(long, default_value = "")]
    vibe: String,
    #[arg(long, default_value = "unisex")]
    gender: String,
    #[arg(long)]
    sizes: Option<String>,
    /// Comma-separated color preferences.
    #[arg(long)]
    colors: Option<String>,
    /// Extend the color preferences with the photo's dominant palette.
    #[arg(long)]
    photo: Option<PathBuf>,
    #[arg(long)]
    describe: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct PaletteArgs {
    #[arg(long)]
    photo: PathBuf,
    #[arg(long, default_value_t = 4)]
    colors: usize,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fitcheck error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::TryOn(args) => run_try_on(args),
        Command::Plan(args) => {
            run_plan(args)?;
            Ok(0)
        }
        Command::Palette(args) => {
            run_palette(args)?;
            Ok(0)
        }
    }
}

fn run_try_on(args: TryOnArgs) -> Result<i32> {
    let person_bytes = fs::read(&args.person)
        .with_context(|| format!("failed reading person image ({})", args.person.display()))?;
    let garment_bytes = fs::read(&args.garment)
        .with_context(|| format!("failed reading garment image ({})", args.garment.display()))?;

    let Some(category) = GarmentCategory::parse(&args.category) else {
        bail!("unknown garment category '{}'", args.category);
    };
    let params = TryOnParams {
        category,
        crop: !args.no_crop,
        steps: args.steps,
        guidance: args.guidance,
        seed: seed_option(args.seed),
    };

    let config = EngineConfig::from_env();
    let engine = TryOnEngine::new(&config, &args.out)?;
    let results = engine.run_try_on(
        &person_bytes,
        &garment_bytes,
        args.model.as_deref(),
        &params,
        args.variants.max(1),
        !args.no_fallback,
    )?;

    let http = HttpClient::new();
    let mut succeeded = 0usize;
    for result in &results {
        match &result.outcome {
            VariantOutcome::Success(reference) => {
                succeeded += 1;
                let artifact = save_variant_artifact(
                    &http,
                    engine.session_dir(),
                    result.variant_index,
                    reference,
                )?;
                println!(
                    "variant {:02}: ok -> {}",
                    result.variant_index,
                    artifact.display()
                );
            }
            VariantOutcome::Failure {
                stage,
                kind,
                detail,
            } => {
                println!(
                    "variant {:02}: {} at {} ({})",
                    result.variant_index,
                    kind.as_str(),
                    stage.as_str(),
                    detail
                );
            }
        }
    }
    println!(
        "{succeeded}/{} variants succeeded; receipts in {}",
        results.len(),
        engine.session_dir().display()
    );
    Ok(if succeeded > 0 { 0 } else { 1 })
}

fn save_variant_artifact(
    http: &HttpClient,
    session_dir: &Path,
    variant_index: usize,
    reference: &ResultImageReference,
) -> Result<PathBuf> {
    let (bytes, mime) = match reference {
        ResultImageReference::Url(url) => {
            let response = http
                .get(url)
                .send()
                .with_context(|| format!("failed downloading result image ({url})"))?;
            if !response.status().is_success() {
                let code = response.status().as_u16();
                bail!("result image download failed ({code}): {url}");
            }
            let mime = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| "image/png".to_string());
            let bytes = response
                .bytes()
                .context("failed reading result image bytes")?
                .to_vec();
            (bytes, mime)
        }
        ResultImageReference::Bytes { bytes, mime } => (bytes.clone(), mime.clone()),
    };

    let path = session_dir.join(format!(
        "variant-{variant_index:02}.{}",
        extension_for_mime(&mime)
    ));
    fs::write(&path, &bytes)
        .with_context(|| format!("failed writing result image ({})", path.display()))?;
    Ok(path)
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let mut colors = split_colors(args.colors.as_deref());
    if let Some(photo) = &args.photo {
        let bytes = fs::read(photo)
            .with_context(|| format!("failed reading photo ({})", photo.display()))?;
        colors.extend(extract_palette(&bytes, 4)?);
    }

    let request = PlanRequest {
        occasion: non_empty_arg(&args.occasion),
        vibe: non_empty_arg(&args.vibe),
        gender: non_empty_arg(&args.gender),
        sizes: args.sizes.clone(),
        colors,
        budget_eur: args.budget,
    };
    let plan = build_outfit_plan(&request);

    let description = if args.describe {
        let narrator = OutfitNarrator::new(&EngineConfig::from_env());
        Some(narrator.describe(&plan_summary_prompt(&request)))
    } else {
        None
    };

    if args.json {
        let mut payload = plan_to_json(&request, &plan);
        if let Some(text) = &description {
            payload["description"] = json!(text);
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_plan_text(&request, &plan);
        if let Some(text) = &description {
            println!();
            println!("{text}");
        }
    }
    Ok(())
}

fn run_palette(args: PaletteArgs) -> Result<()> {
    let bytes = fs::read(&args.photo)
        .with_context(|| format!("failed reading photo ({})", args.photo.display()))?;
    let palette = extract_palette(&bytes, args.colors.max(1))?;
    for hex in palette {
        println!("{hex}");
    }
    Ok(())
}

fn print_plan_text(request: &PlanRequest, plan: &[SlotPlan]) {
    println!("Outfit plan for {} EUR", request.budget_eur);
    for slot in plan {
        println!();
        println!("{} ({} EUR): {}", slot.slot, slot.price_eur, slot.query);
        for link in &slot.links {
            println!("  {}: {}", link.retailer, link.url);
        }
    }
}

fn plan_to_json(request: &PlanRequest, plan: &[SlotPlan]) -> Value {
    json!({
        "budget_eur": request.budget_eur,
        "occasion": request.occasion,
        "vibe": request.vibe,
        "gender": request.gender,
        "sizes": request.sizes,
        "colors": request.colors,
        "slots": plan,
    })
}

fn plan_summary_prompt(request: &PlanRequest) -> String {
    let colors = if request.colors.is_empty() {
        "—".to_string()
    } else {
        request.colors.join(", ")
    };
    format!(
        "Occasion: {}\nVibe: {}\nGender: {}\nSizes: {}\nColors: {}\nBudget: {}€",
        request.occasion.as_deref().unwrap_or("any"),
        request.vibe.as_deref().unwrap_or("any"),
        request.gender.as_deref().unwrap_or("unisex"),
        request.sizes.as_deref().unwrap_or("any"),
        colors,
        request.budget_eur
    )
}

fn seed_option(raw: i64) -> Option<i64> {
    (raw >= 0).then_some(raw)
}

fn split_colors(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_arg(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("png") {
        "png"
    } else if lowered.contains("webp") {
        "webp"
    } else {
        "jpg"
    }
}

use indexmap::IndexSet;
use serde::Serialize;

pub const RETAILERS: [(&str, &str); 4] = [
    ("Zalando", "https://www.zalando.de/catalog/?q={q}"),
    ("ASOS", "https://www.asos.com/search/?q={q}"),
    ("H&M", "https://www2.hm.com/en_eur/search-results.html?q={q}"),
    ("Amazon", "https://www.amazon.de/s?k={q}"),
];

/// Slot name, share of the total budget, search-term suffix.
const OUTFIT_SLOTS: [(&str, f64, &str); 5] = [
    ("Top", 0.22, "top"),
    ("Bottom", 0.22, "pants"),
    ("Outerwear", 0.18, "jacket"),
    ("Shoes", 0.24, "shoes"),
    ("Accessory", 0.14, "accessory"),
];

const MIN_SLOT_EUR: u32 = 10;

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub occasion: Option<String>,
    pub vibe: Option<String>,
    pub gender: Option<String>,
    pub sizes: Option<String>,
    pub colors: Vec<String>,
    pub budget_eur: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetailerLink {
    pub retailer: String,
    pub url: String,
}

/// One budgeted outfit slot, serializable as-is for machine consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SlotPlan {
    pub slot: String,
    pub price_eur: u32,
    pub query: String,
    pub links: Vec<RetailerLink>,
}

fn style_keywords(vibe: &str) -> Vec<String> {
    let keywords: &[&str] = match vibe.trim().to_ascii_lowercase().as_str() {
        "casual" => &["t-shirt", "jeans", "sneakers"],
        "smart casual" => &["oxford shirt", "chinos", "loafers"],
        "business" => &["blazer", "trousers", "derby shoes"],
        "evening" => &["silk blouse", "dress pants", "heels"],
        "streetwear" => &["oversized hoodie", "cargo pants", "chunky sneakers"],
        _ => return vec![vibe.trim().to_string()],
    };
    keywords.iter().map(|item| (*item).to_string()).collect()
}

fn gender_keywords(gender: &str) -> Vec<String> {
    let keywords: &[&str] = match gender.trim().to_ascii_lowercase().as_str() {
        "male" => &["men"],
        "female" => &["women"],
        "unisex" => &["unisex"],
        _ => return vec![gender.trim().to_string()],
    };
    keywords.iter().map(|item| (*item).to_string()).collect()
}

pub fn budget_split(total: u32) -> Vec<(String, u32)> {
    OUTFIT_SLOTS
        .iter()
        .map(|(name, share, _)| {
            let price = ((total as f64) * share) as u32;
            ((*name).to_string(), price.max(MIN_SLOT_EUR))
        })
        .collect()
}

/// One search query per slot: the shared base terms (style, gender, colors,
/// sizes, occasion, de-duplicated preserving first occurrence) plus the
/// slot-specific suffix.
pub fn build_queries(request: &PlanRequest) -> Vec<(String, String)> {
    let mut base: IndexSet<String> = IndexSet::new();
    if let Some(vibe) = non_empty(&request.vibe) {
        base.extend(style_keywords(vibe));
    }
    if let Some(gender) = non_empty(&request.gender) {
        base.extend(gender_keywords(gender));
    }
    for color in &request.colors {
        let trimmed = color.trim();
        if !trimmed.is_empty() {
            base.insert(trimmed.to_string());
        }
    }
    if let Some(sizes) = non_empty(&request.sizes) {
        base.insert(sizes.to_string());
    }
    if let Some(occasion) = non_empty(&request.occasion) {
        base.insert(occasion.to_string());
    }

    let base_terms: Vec<String> = base.into_iter().collect();
    OUTFIT_SLOTS
        .iter()
        .map(|(name, _, suffix)| {
            let mut terms = base_terms.clone();
            terms.push((*suffix).to_string());
            ((*name).to_string(), terms.join(" "))
        })
        .collect()
}

pub fn retailer_links(query: &str) -> Vec<RetailerLink> {
    let encoded = query.replace(' ', "+");
    RETAILERS
        .iter()
        .map(|(name, template)| RetailerLink {
            retailer: (*name).to_string(),
            url: template.replace("{q}", &encoded),
        })
        .collect()
}

pub fn build_outfit_plan(request: &PlanRequest) -> Vec<SlotPlan> {
    let splits = budget_split(request.budget_eur);
    let queries = build_queries(request);
    splits
        .into_iter()
        .zip(queries)
        .map(|((slot, price_eur), (_, query))| SlotPlan {
            links: retailer_links(&query),
            slot,
            price_eur,
            query,
        })
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

use indexmap::IndexMap;

use crate::tryon::{EndpointContract, FieldVariant, ReferenceKind, SizeEnvelope};

pub const IDM_VTON_VERSION: &str =
    "cuuupid/idm-vton:0513734a452173b8173e907e3a59d19a36266e55b48528559432bd21c7d7e985";
pub const ECOM_VTON_VERSION: &str =
    "wolverinn/ecommerce-virtual-try-on:39860afc9f164ce9734d5666d17a771f986dd2bd3ad0935d845054f73bbec447";

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, EndpointContract>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, EndpointContract>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EndpointContract> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &EndpointContract> {
        self.models.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Fallback order for a primary model: the primary first, then the other
    /// catalogued models in declaration order. `dryrun` never participates
    /// unless it was the primary.
    pub fn fallback_chain(&self, primary: &str) -> Vec<EndpointContract> {
        let mut chain = Vec::new();
        if let Some(contract) = self.get(primary) {
            chain.push(contract.clone());
        }
        for contract in self.models.values() {
            if contract.name == primary || contract.provider == "dryrun" {
                continue;
            }
            chain.push(contract.clone());
        }
        chain
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, EndpointContract> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      version: Option<&str>,
                      accepts: &[ReferenceKind],
                      field_variants: &[(&str, &str)],
                      knobs: &[&str],
                      envelope: SizeEnvelope| {
        map.insert(
            name.to_string(),
            EndpointContract {
                name: name.to_string(),
                provider: provider.to_string(),
                version: version.map(str::to_string),
                accepts: accepts.to_vec(),
                field_variants: field_variants
                    .iter()
                    .map(|(person, garment)| FieldVariant::new(person, garment))
                    .collect(),
                knobs: knobs.iter().map(|item| (*item).to_string()).collect(),
                envelope,
            },
        );
    };

    insert(
        "idm-vton",
        "replicate",
        Some(IDM_VTON_VERSION),
        &[ReferenceKind::RemoteUrl, ReferenceKind::InlineEncoded],
        &[("human_img", "garm_img"), ("human_image", "cloth_image")],
        &["category", "crop", "steps", "seed"],
        SizeEnvelope::new(512, 1024, 90),
    );
    insert(
        "ecommerce-virtual-try-on",
        "replicate",
        Some(ECOM_VTON_VERSION),
        &[ReferenceKind::RemoteUrl, ReferenceKind::InlineEncoded],
        &[
            ("face_image", "commerce_image"),
            ("image_person", "image_clothing"),
        ],
        &[],
        SizeEnvelope::new(512, 1024, 90),
    );
    insert(
        "try-on-diffusion",
        "segmind",
        None,
        &[ReferenceKind::InlineEncoded],
        &[
            ("model_image", "cloth_image"),
            ("model_image_b64", "cloth_image_b64"),
        ],
        &["category", "steps", "guidance", "seed"],
        SizeEnvelope::new(768, 1536, 95),
    );
    insert(
        "dryrun",
        "dryrun",
        None,
        &[ReferenceKind::DirectBytes],
        &[("person_image", "garment_image")],
        &["category", "crop", "steps", "guidance", "seed"],
        SizeEnvelope::default(),
    );

    map
}

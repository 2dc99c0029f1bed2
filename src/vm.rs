//! Generic "virtual machine" services: long-lived OS containers

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

use crate::db::{ResourceLimits, ServiceKind, ServiceRecord, SourceType};

/// OS images a VM may be created from
pub const OS_IMAGES: &[&str] = &[
    "ubuntu:22.04",
    "ubuntu:24.04",
    "debian:12",
    "alpine:3.19",
    "centos:stream9",
];

/// One core, 1 GiB
pub const DEFAULT_VM_LIMITS: ResourceLimits = ResourceLimits {
    cpu: 1.0,
    memory: 1_073_741_824,
};

const ADJECTIVES: &[&str] = &[
    "brave", "swift", "cosmic", "neon", "frost", "amber", "steel", "pixel", "turbo", "nova",
    "lunar", "solar", "hyper", "cyber", "ghost", "vapor", "storm", "blaze", "coral", "azure",
];

const NOUNS: &[&str] = &[
    "panda", "falcon", "tiger", "wolf", "phoenix", "nebula", "vortex", "cipher", "prism", "comet",
    "raven", "hawk", "lynx", "drake", "pulse", "nexus", "atlas", "onyx", "echo", "spark",
];

pub fn is_supported_image(image: &str) -> bool {
    OS_IMAGES.contains(&image)
}

/// Random `<adjective>-<noun>-<n>` name
pub fn generate_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("brave");
    let noun = NOUNS.choose(rng).copied().unwrap_or("panda");
    format!("{}-{}-{}", adjective, noun, rng.gen_range(0..100))
}

/// Parameters for a new VM
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub os_image: String,
    pub limits: ResourceLimits,
    pub internal_port: u16,
    pub env_vars: HashMap<String, String>,
    pub startup_script: Option<String>,
}

/// A fresh VM record; the caller assigns the port
pub fn new_record(spec: &VmSpec) -> ServiceRecord {
    let mut record = ServiceRecord::new_app(&spec.name, SourceType::Image, spec.limits);
    record.kind = ServiceKind::Vm;
    record.source_url = Some(spec.os_image.clone());
    record.internal_port = spec.internal_port;
    record.env_vars = spec.env_vars.clone();
    record.startup_script = spec
        .startup_script
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    record.resource_preset = "custom".to_string();
    record.restart_policy = "unless-stopped".to_string();
    record.framework = Some(spec.os_image.clone());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_name_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let name = generate_name(&mut rng);
            let parts: Vec<&str> = name.split('-').collect();
            assert_eq!(parts.len(), 3);
            assert!(ADJECTIVES.contains(&parts[0]));
            assert!(NOUNS.contains(&parts[1]));
            assert!(parts[2].parse::<u8>().unwrap() < 100);
        }
    }

    #[test]
    fn test_supported_images() {
        assert!(is_supported_image("alpine:3.19"));
        assert!(!is_supported_image("alpine:latest"));
    }

    #[test]
    fn test_new_record() {
        let spec = VmSpec {
            name: "frost-wolf-3".to_string(),
            os_image: "debian:12".to_string(),
            limits: DEFAULT_VM_LIMITS,
            internal_port: 8080,
            env_vars: HashMap::new(),
            startup_script: Some("   ".to_string()),
        };
        let record = new_record(&spec);
        assert_eq!(record.kind, ServiceKind::Vm);
        assert_eq!(record.source_type, SourceType::Image);
        assert_eq!(record.source_url.as_deref(), Some("debian:12"));
        assert_eq!(record.restart_policy, "unless-stopped");
        assert!(record.startup_script.is_none());
        assert_eq!(record.internal_port, 8080);
    }
}

//! Bioelectric tissue model.
//!
//! The interactive frontend ships a JSON blob of membrane physiology
//! parameters. That blob is parsed exactly once, here, into a flat
//! [`BioelectricState`]; everything downstream works with the struct. The
//! generator turns a state into a 64^3 potential field normalized so that
//! 0 maps to -100 mV and 1 to +100 mV.

use rayon::prelude::*;
use serde::Deserialize;

use crate::VolumeField;

/// Grid edge length of the generated tissue volume.
pub const TISSUE_DIM: u32 = 64;

/// Flattened membrane physiology parameters driving the generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BioelectricState {
    /// Extracellular Na+ concentration (mM).
    pub sodium_conc: f32,
    /// Extracellular K+ concentration (mM).
    pub potassium_conc: f32,
    /// Resting membrane potential (mV).
    pub resting_potential: f32,
    /// Voltage-gated Na+ channel conductance (mS/cm^2).
    pub nav_conductance: f32,
    /// Voltage-gated K+ channel conductance (mS/cm^2).
    pub kv_conductance: f32,
    /// Gap junction conductance (nS).
    pub gap_junction_cond: f32,
    pub gap_junctions_enabled: bool,
}

impl Default for BioelectricState {
    fn default() -> Self {
        Self {
            sodium_conc: 145.0,
            potassium_conc: 5.0,
            resting_potential: -70.0,
            nav_conductance: 120.0,
            kv_conductance: 36.0,
            gap_junction_cond: 50.0,
            gap_junctions_enabled: true,
        }
    }
}

// Wire schema of the frontend payload. Sections and fields are all optional;
// anything absent keeps its default.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawBioParams {
    ion_concentrations: RawIons,
    membrane_properties: RawMembrane,
    channels: Vec<RawChannel>,
    gap_junctions: Option<RawGapJunctions>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawIons {
    sodium: f32,
    potassium: f32,
}

impl Default for RawIons {
    fn default() -> Self {
        let d = BioelectricState::default();
        Self {
            sodium: d.sodium_conc,
            potassium: d.potassium_conc,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMembrane {
    resting_potential: f32,
}

impl Default for RawMembrane {
    fn default() -> Self {
        Self {
            resting_potential: BioelectricState::default().resting_potential,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChannel {
    name: String,
    conductance: f32,
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGapJunctions {
    conductance: f32,
    enabled: bool,
}

impl BioelectricState {
    /// Parses the frontend JSON payload. Unknown fields are ignored; missing
    /// sections fall back to defaults, so a partial update is always safe.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: RawBioParams = serde_json::from_str(json)?;
        let mut state = Self {
            sodium_conc: raw.ion_concentrations.sodium,
            potassium_conc: raw.ion_concentrations.potassium,
            resting_potential: raw.membrane_properties.resting_potential,
            ..Self::default()
        };
        for channel in &raw.channels {
            if !channel.enabled {
                continue;
            }
            if channel.name.starts_with("Nav") {
                state.nav_conductance = channel.conductance;
            } else if channel.name.starts_with("Kv") {
                state.kv_conductance = channel.conductance;
            }
        }
        if let Some(gj) = raw.gap_junctions {
            state.gap_junction_cond = gj.conductance;
            state.gap_junctions_enabled = gj.enabled;
        }
        Ok(state)
    }

    /// Synthesizes the tissue potential field for this parameter set.
    ///
    /// Deterministic: equal states produce bit-identical volumes. The slices
    /// along z are independent, so they fill in parallel.
    pub fn generate_volume(&self) -> VolumeField {
        let n = TISSUE_DIM as usize;
        let state = *self;
        let mut data = vec![0.0f32; n * n * n];

        data.par_chunks_mut(n * n)
            .enumerate()
            .for_each(|(z, slice)| {
                let fz = z as f32 / (n - 1) as f32;
                for y in 0..n {
                    let fy = y as f32 / (n - 1) as f32;
                    for x in 0..n {
                        let fx = x as f32 / (n - 1) as f32;
                        slice[x + y * n] = state.potential_at(fx, fy, fz);
                    }
                }
            });

        // Geometry is valid by construction.
        VolumeField::new([TISSUE_DIM; 3], [1.0; 3], [0.0; 3], data)
            .unwrap_or_else(|_| unreachable!("generated grid is well-formed"))
    }

    fn potential_at(&self, fx: f32, fy: f32, fz: f32) -> f32 {
        // Base tissue potential, normalizing -100..+100 mV onto 0..1.
        let mut value = (self.resting_potential + 100.0) / 200.0;

        // Centered hyperpolarized region, weighted by K+ concentration.
        let dx = fx - 0.5;
        let dy = fy - 0.5;
        let dz = fz - 0.5;
        let dist = (dx * dx + dy * dy + dz * dz).sqrt();
        if dist < 0.25 {
            let hyperpolarization = self.potassium_conc / 50.0;
            value = 0.1 * hyperpolarization + (1.0 - dist / 0.25) * 0.2;
        }

        // Off-center depolarized region, weighted by Na+ concentration.
        let dx = fx - 0.7;
        let dy = fy - 0.3;
        let dz = fz - 0.6;
        let dist = (dx * dx + dy * dy + dz * dz).sqrt();
        if dist < 0.2 {
            let depolarization = self.sodium_conc / 145.0;
            value = value.max(0.8 * depolarization + (1.0 - dist / 0.2) * 0.2);
        }

        // Travelling action-potential wave, scaled by channel conductances.
        let wave_strength = (self.nav_conductance + self.kv_conductance) / 300.0;
        value += ((fx + fy) * 10.0 - fz * 5.0).sin() * 0.1 * wave_strength;

        // Gap junction lattice.
        if self.gap_junctions_enabled {
            let network_strength = self.gap_junction_cond / 100.0;
            value += (fx * 20.0).sin() * (fy * 20.0).sin() * (fz * 20.0).sin()
                * 0.05
                * network_strength;
        }

        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let state = BioelectricState::default();
        let a = state.generate_volume();
        let b = state.generate_volume();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn all_samples_in_unit_range() {
        let volume = BioelectricState::default().generate_volume();
        assert!(volume.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn gap_junctions_change_the_field() {
        let on = BioelectricState::default().generate_volume();
        let off = BioelectricState {
            gap_junctions_enabled: false,
            ..Default::default()
        }
        .generate_volume();

        let differing = on
            .data()
            .iter()
            .zip(off.data())
            .filter(|(a, b)| a != b)
            .count();
        assert!(
            differing * 20 > on.voxel_count(),
            "only {differing} of {} voxels differ",
            on.voxel_count()
        );
    }

    #[test]
    fn parses_frontend_payload() {
        let json = r#"{
            "ionConcentrations": {"sodium": 120.0, "potassium": 8.0, "chloride": 110, "calcium": 2},
            "membraneProperties": {"restingPotential": -55.0, "capacitance": 1, "temperature": 37},
            "channels": [
                {"name": "Nav1.2 (Voltage-gated Na+)", "conductance": 80.0, "enabled": true},
                {"name": "Kv1.1 (Voltage-gated K+)", "conductance": 30.0, "enabled": false}
            ],
            "gapJunctions": {"conductance": 10.0, "enabled": false}
        }"#;
        let state = BioelectricState::from_json(json).unwrap();
        assert_eq!(state.sodium_conc, 120.0);
        assert_eq!(state.potassium_conc, 8.0);
        assert_eq!(state.resting_potential, -55.0);
        assert_eq!(state.nav_conductance, 80.0);
        // Disabled channel keeps the default conductance.
        assert_eq!(state.kv_conductance, 36.0);
        assert_eq!(state.gap_junction_cond, 10.0);
        assert!(!state.gap_junctions_enabled);
    }

    #[test]
    fn empty_payload_keeps_defaults() {
        let state = BioelectricState::from_json("{}").unwrap();
        assert_eq!(state, BioelectricState::default());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(BioelectricState::from_json("QUALITY high").is_err());
    }
}

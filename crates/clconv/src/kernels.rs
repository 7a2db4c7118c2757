//! Program template registry and build-option rendering.
//!
//! Each execution strategy launches one or two named program templates. A [`KernelSpec`] pins a
//! template to a concrete specialization: the element type macros plus the channel counts of the
//! problem, rendered as `-D NAME=VALUE` build options.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{BackendError, BackendResult};
use crate::tensor::Real;

pub const GEMM1X1_TEMPLATE: &str = "conv.gemm1x1";
pub const MEC_LOWERING_TEMPLATE: &str = "conv.mec_lowering";
pub const MEC_GEMM_TEMPLATE: &str = "conv.mec_gemm";
pub const DIRECT_TEMPLATE: &str = "conv.direct";

pub const REAL: &str = "REAL";
pub const REAL4: &str = "REAL4";
pub const READ_IMAGE: &str = "READ_IMAGE";
pub const KERNEL: &str = "KERNEL";
pub const IN_CHANNEL: &str = "IN_CHANNEL";
pub const OUT_CHANNEL: &str = "OUT_CHANNEL";
pub const IN_CHANNEL_DIV_G: &str = "IN_CHANNEL_DIV_G";
pub const OUT_CHANNEL_DIV_G: &str = "OUT_CHANNEL_DIV_G";
pub const FILTER_DIV_G: &str = "FILTER_DIV_G";

/// Output pixels handled by one gemm1x1 work item along the spatial axis.
pub const GEMM1X1_PIXELS_PER_ITEM: usize = 4;
/// Output channels handled by one gemm1x1 work item.
pub const GEMM1X1_CHANNELS_PER_ITEM: usize = 8;
pub const MEC_GEMM_CHANNELS_PER_ITEM: usize = 4;
pub const MEC_GEMM_COLUMNS_PER_ITEM: usize = 8;
pub const DIRECT_COLUMNS_PER_ITEM: usize = 4;
pub const DIRECT_CHANNELS_PER_ITEM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    Gemm1x1,
    MecLowering,
    MecGemm,
    Direct,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::Gemm1x1,
        KernelKind::MecLowering,
        KernelKind::MecGemm,
        KernelKind::Direct,
    ];

    pub const fn template(self) -> &'static str {
        match self {
            KernelKind::Gemm1x1 => GEMM1X1_TEMPLATE,
            KernelKind::MecLowering => MEC_LOWERING_TEMPLATE,
            KernelKind::MecGemm => MEC_GEMM_TEMPLATE,
            KernelKind::Direct => DIRECT_TEMPLATE,
        }
    }

    pub fn from_template(template: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.template() == template)
    }

    /// Number of positional arguments the template's entry point takes.
    pub const fn arity(self) -> usize {
        match self {
            KernelKind::Gemm1x1 => 10,
            KernelKind::MecLowering => 8,
            KernelKind::MecGemm => 12,
            KernelKind::Direct => 11,
        }
    }

    /// Defines a build of this template must provide.
    pub const fn required_defines(self) -> &'static [&'static str] {
        match self {
            KernelKind::Gemm1x1 => &[
                REAL,
                REAL4,
                READ_IMAGE,
                KERNEL,
                IN_CHANNEL_DIV_G,
                OUT_CHANNEL_DIV_G,
                FILTER_DIV_G,
            ],
            KernelKind::MecLowering | KernelKind::MecGemm | KernelKind::Direct => {
                &[REAL, REAL4, READ_IMAGE, KERNEL, IN_CHANNEL, OUT_CHANNEL]
            }
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template())
    }
}

/// A template plus the ordered substitutions it is built with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSpec {
    pub kind: KernelKind,
    pub substitutions: Vec<(String, String)>,
}

impl KernelSpec {
    pub fn template(&self) -> &'static str {
        self.kind.template()
    }

    pub fn build_options(&self) -> String {
        build_argument_list(&self.substitutions)
    }

    pub fn define(&self, name: &str) -> Option<&str> {
        self.substitutions
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn element_substitutions<T: Real>(kernel: usize) -> Vec<(String, String)> {
    vec![
        (REAL.to_string(), T::REAL_NAME.to_string()),
        (REAL4.to_string(), T::VECTOR_NAME.to_string()),
        (READ_IMAGE.to_string(), T::READ_IMAGE.to_string()),
        (KERNEL.to_string(), kernel.to_string()),
    ]
}

fn channel_spec<T: Real>(
    kind: KernelKind,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
) -> KernelSpec {
    let mut substitutions = element_substitutions::<T>(kernel);
    substitutions.push((IN_CHANNEL.to_string(), in_channels.to_string()));
    substitutions.push((OUT_CHANNEL.to_string(), out_channels.to_string()));
    KernelSpec {
        kind,
        substitutions,
    }
}

/// `filter_per_group` is the filter's total element count divided by the group count.
pub fn gemm1x1_kernel_spec<T: Real>(
    in_channels_per_group: usize,
    out_channels_per_group: usize,
    filter_per_group: usize,
    kernel: usize,
) -> KernelSpec {
    let mut substitutions = element_substitutions::<T>(kernel);
    substitutions.push((
        IN_CHANNEL_DIV_G.to_string(),
        in_channels_per_group.to_string(),
    ));
    substitutions.push((
        OUT_CHANNEL_DIV_G.to_string(),
        out_channels_per_group.to_string(),
    ));
    substitutions.push((FILTER_DIV_G.to_string(), filter_per_group.to_string()));
    KernelSpec {
        kind: KernelKind::Gemm1x1,
        substitutions,
    }
}

pub fn mec_lowering_kernel_spec<T: Real>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
) -> KernelSpec {
    channel_spec::<T>(KernelKind::MecLowering, in_channels, out_channels, kernel)
}

pub fn mec_gemm_kernel_spec<T: Real>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
) -> KernelSpec {
    channel_spec::<T>(KernelKind::MecGemm, in_channels, out_channels, kernel)
}

pub fn direct_kernel_spec<T: Real>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
) -> KernelSpec {
    channel_spec::<T>(KernelKind::Direct, in_channels, out_channels, kernel)
}

/// Renders substitutions as a space separated `-D NAME=VALUE` list.
pub fn build_argument_list(substitutions: &[(String, String)]) -> String {
    substitutions
        .iter()
        .map(|(name, value)| format!("-D {name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`build_argument_list`], used by devices that interpret the defines themselves.
pub fn parse_build_options(options: &str) -> BackendResult<HashMap<String, String>> {
    let mut defines = HashMap::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        let definition = match token {
            "-D" => tokens.next().ok_or_else(|| {
                BackendError::execution(format!("dangling -D in build options '{options}'"))
            })?,
            other => other.strip_prefix("-D").ok_or_else(|| {
                BackendError::execution(format!("unsupported build option '{other}'"))
            })?,
        };
        let (name, value) = definition.split_once('=').ok_or_else(|| {
            BackendError::execution(format!("define '{definition}' has no value"))
        })?;
        if name.is_empty() {
            return Err(BackendError::execution(format!(
                "define '{definition}' has an empty name"
            )));
        }
        defines.insert(name.to_string(), value.to_string());
    }
    Ok(defines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn build_options_keep_substitution_order() {
        let spec = direct_kernel_spec::<f32>(8, 16, 3);
        assert_eq!(
            spec.build_options(),
            "-D REAL=float -D REAL4=float4 -D READ_IMAGE=read_imagef -D KERNEL=3 \
             -D IN_CHANNEL=8 -D OUT_CHANNEL=16"
        );
    }

    #[test]
    fn half_specialization_uses_half_macros() {
        let spec = mec_gemm_kernel_spec::<f16>(4, 4, 3);
        assert_eq!(spec.define(REAL), Some("half"));
        assert_eq!(spec.define(REAL4), Some("half4"));
        assert_eq!(spec.define(READ_IMAGE), Some("read_imageh"));
    }

    #[test]
    fn specs_carry_every_required_define() {
        let specs = [
            gemm1x1_kernel_spec::<f32>(2, 4, 8, 1),
            mec_lowering_kernel_spec::<f32>(4, 4, 3),
            mec_gemm_kernel_spec::<f32>(4, 4, 3),
            direct_kernel_spec::<f32>(4, 4, 3),
        ];
        for spec in &specs {
            for name in spec.kind.required_defines() {
                assert!(spec.define(name).is_some(), "{} lacks {name}", spec.kind);
            }
        }
    }

    #[test]
    fn channel_counts_distinguish_specs() {
        assert_ne!(
            direct_kernel_spec::<f32>(4, 4, 3),
            direct_kernel_spec::<f32>(8, 4, 3)
        );
        assert_ne!(
            direct_kernel_spec::<f32>(4, 4, 3),
            direct_kernel_spec::<f16>(4, 4, 3)
        );
    }

    #[test]
    fn parse_build_options_inverts_rendering() {
        let spec = gemm1x1_kernel_spec::<f32>(2, 4, 8, 1);
        let defines = parse_build_options(&spec.build_options()).expect("parse");
        assert_eq!(defines.len(), spec.substitutions.len());
        assert_eq!(defines.get(FILTER_DIV_G).map(String::as_str), Some("8"));
    }

    #[test]
    fn parse_build_options_accepts_attached_form() {
        let defines = parse_build_options("-DREAL=float -D KERNEL=1").expect("parse");
        assert_eq!(defines.get(REAL).map(String::as_str), Some("float"));
        assert_eq!(defines.get(KERNEL).map(String::as_str), Some("1"));
    }

    #[test]
    fn parse_build_options_rejects_malformed_input() {
        assert!(parse_build_options("-D").is_err());
        assert!(parse_build_options("-O3").is_err());
        assert!(parse_build_options("-D KERNEL").is_err());
    }

    #[test]
    fn templates_resolve_to_kinds() {
        for kind in KernelKind::ALL {
            assert_eq!(KernelKind::from_template(kind.template()), Some(kind));
        }
        assert_eq!(KernelKind::from_template("conv.winograd"), None);
    }
}

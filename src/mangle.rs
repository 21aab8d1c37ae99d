//! Symbol mangling.
//!
//! Class members map onto flat assembly symbols: methods as
//! `__<Class>_M_<Method>`, instance fields as `__<Class>_I_<Field>`, with
//! user underscores doubled so the scheme stays injective. Darwin and
//! Windows prefix every external symbol with an underscore; the platform is
//! an explicit parameter, never a process-wide flag.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Darwin,
    Windows,
}

impl Platform {
    fn underscore_prefix(self) -> &'static str {
        match self {
            Platform::Linux => "",
            Platform::Darwin | Platform::Windows => "_",
        }
    }
}

const SEP: &str = "_";

fn replace_sep(name: &str) -> String {
    name.replace(SEP, "__")
}

pub fn mangle_class_name(class_name: &str) -> String {
    format!("{}{}{}", SEP, SEP, replace_sep(class_name))
}

pub fn mangle_method_name(class_name: &str, method_name: &str) -> String {
    format!(
        "{}{}M{}{}",
        mangle_class_name(class_name),
        SEP,
        SEP,
        replace_sep(method_name)
    )
}

pub fn mangle_instance_field_name(class_name: &str, field_name: &str) -> String {
    format!(
        "{}{}I{}{}",
        mangle_class_name(class_name),
        SEP,
        SEP,
        replace_sep(field_name)
    )
}

/// The assembly-level name of an already-mangled symbol on `platform`.
pub fn external_symbol(name: &str, platform: Platform) -> String {
    format!("{}{}", platform.underscore_prefix(), name)
}

pub fn mangled_main_method_name(platform: Platform) -> String {
    format!("{}mjMain", platform.underscore_prefix())
}

pub fn mangled_print_int_method_name(platform: Platform) -> String {
    format!("{}print_int", platform.underscore_prefix())
}

pub fn mangled_calloc_method_name(platform: Platform) -> String {
    format!("{}calloc_impl", platform.underscore_prefix())
}

#[cfg(test)]
#[path = "tests/t_mangle.rs"]
mod tests;

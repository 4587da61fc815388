//! taskbench Macros
//!
//! `#[task_test]` registers a function taking `&mut TestContext` with the
//! taskbench test registry.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{ItemFn, parse_macro_input};

mod attr {
    use syn::meta::ParseNestedMeta;

    /// Get the attribute name as a string
    pub fn name(meta: &ParseNestedMeta) -> String {
        meta.path
            .get_ident()
            .map(|i| i.to_string())
            .unwrap_or_default()
    }

    /// Parse a string literal attribute: `attr = "value"`
    pub fn string(meta: &ParseNestedMeta) -> syn::Result<syn::LitStr> {
        meta.value()?.parse()
    }

    /// Create an unknown attribute error
    pub fn unknown(meta: &ParseNestedMeta, name: &str) -> syn::Error {
        meta.error(format!("unknown attribute: {}", name))
    }
}

/// Register a taskbench test
///
/// # Example
///
/// ```ignore
/// #[task_test]
/// fn sums_three_values(ctx: &mut TestContext) { ... }
///
/// // Explicit suite, name and kind
/// #[task_test(suite = "sum", name = "rayon_pipeline", kind = "perf")]
/// fn rayon_pipeline(ctx: &mut TestContext) { ... }
/// ```
///
/// `suite` defaults to the defining module path, `name` to the function
/// name and `kind` to `"func"`.
#[proc_macro_attribute]
pub fn task_test(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(args);
    let func = parse_macro_input!(item as ItemFn);

    task_test_impl(args, func)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

fn task_test_impl(args: TokenStream2, func: ItemFn) -> Result<TokenStream2, syn::Error> {
    validate_signature(&func)?;
    let config = parse_test_config(args)?;

    let fn_name = &func.sig.ident;
    let wrapper_name = format_ident!("_taskbench_wrapper_{}", fn_name);

    let suite = config
        .suite
        .map(|s| quote! { #s })
        .unwrap_or(quote! { module_path!() });
    let name = config
        .name
        .map(|n| quote! { #n })
        .unwrap_or_else(|| {
            let n = fn_name.to_string();
            quote! { #n }
        });
    let kind = match config.kind.as_ref().map(|k| (k.value(), k)) {
        None => quote! { ::taskbench::TestKind::Functional },
        Some((k, _)) if k == "func" || k == "functional" => {
            quote! { ::taskbench::TestKind::Functional }
        }
        Some((k, _)) if k == "perf" || k == "performance" => {
            quote! { ::taskbench::TestKind::Perf }
        }
        Some((_, lit)) => {
            return Err(syn::Error::new_spanned(
                lit,
                "taskbench: kind must be \"func\" or \"perf\"",
            ));
        }
    };

    Ok(quote! {
        #func

        #[doc(hidden)]
        #[allow(non_snake_case)]
        fn #wrapper_name(ctx: &mut ::taskbench::TestContext) {
            #fn_name(ctx);
        }

        ::taskbench::internal::inventory::submit! {
            ::taskbench::TestDef {
                suite: #suite,
                name: #name,
                kind: #kind,
                runner_fn: #wrapper_name,
                file: file!(),
                line: line!(),
                module_path: module_path!(),
            }
        }
    })
}

#[derive(Default)]
struct TestConfig {
    suite: Option<syn::LitStr>,
    name: Option<syn::LitStr>,
    kind: Option<syn::LitStr>,
}

fn parse_test_config(args: TokenStream2) -> Result<TestConfig, syn::Error> {
    let mut config = TestConfig::default();
    if args.is_empty() {
        return Ok(config);
    }

    let parser = syn::meta::parser(|meta| {
        let name = attr::name(&meta);
        match name.as_str() {
            "suite" => config.suite = Some(attr::string(&meta)?),
            "name" => config.name = Some(attr::string(&meta)?),
            "kind" => config.kind = Some(attr::string(&meta)?),
            _ => return Err(attr::unknown(&meta, &name)),
        }
        Ok(())
    });

    syn::parse::Parser::parse2(parser, args)?;
    Ok(config)
}

fn validate_signature(func: &ItemFn) -> syn::Result<()> {
    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            func.sig.asyncness,
            "taskbench: test functions cannot be async",
        ));
    }
    if !func.sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &func.sig.generics,
            "taskbench: test functions cannot be generic",
        ));
    }
    if func.sig.inputs.len() != 1 {
        return Err(syn::Error::new_spanned(
            &func.sig,
            "taskbench: Function must take exactly one argument: `&mut TestContext`",
        ));
    }
    Ok(())
}

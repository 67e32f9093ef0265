//! Derive macros for tree-injector
//!
//! - `#[derive(Inject)]` - Generate `Inject::inject` for fields marked `#[needs]`
//!
//! # Example
//!
//! ```rust,ignore
//! use tree_injector::{Component, Dependency, Inject};
//!
//! #[derive(Default, Inject)]
//! struct Player {
//!     #[needs]
//!     audio: Dependency,
//!     #[needs(field = "input_system")]
//!     input: Dependency,
//!     // Not injected
//!     score: u64,
//! }
//!
//! impl Component for Player {}
//! ```
//!
//! The woven resolve method of `Player` stores dependencies under the field
//! names `audio` and `input_system`; the generated `inject` routes them to the
//! matching `Dependency` slots.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields, LitStr, Type};

/// Derive macro routing injected dependencies to `Dependency` fields.
///
/// # Attributes
///
/// - `#[needs]` - The field is injected under its own name.
/// - `#[needs(field = "name")]` - The field is injected under `name`.
///
/// Marked fields must have type `Dependency`. Unknown field names make
/// `inject` return `false`.
#[proc_macro_derive(Inject, attributes(needs))]
pub fn derive_inject(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            Fields::Unit => {
                return quote! {
                    impl #impl_generics ::tree_injector::Inject for #name #ty_generics #where_clause {}
                }
                .into();
            }
            Fields::Unnamed(_) => {
                return syn::Error::new_spanned(
                    &input,
                    "Inject can only be derived for structs with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(&input, "Inject can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let mut arms = Vec::new();
    let mut seen = Vec::new();

    for field in fields {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };

        let injected_name = match needs_attr(&field.attrs) {
            Ok(Some(NeedsAttr { rename })) => rename.unwrap_or_else(|| ident.to_string()),
            Ok(None) => continue,
            Err(error) => return error.to_compile_error().into(),
        };

        if !is_dependency(&field.ty) {
            return syn::Error::new_spanned(
                &field.ty,
                "Fields marked with #[needs] must have type Dependency",
            )
            .to_compile_error()
            .into();
        }

        if seen.contains(&injected_name) {
            return syn::Error::new_spanned(
                ident,
                format!("Duplicate injected field name `{injected_name}`"),
            )
            .to_compile_error()
            .into();
        }

        arms.push(quote! {
            #injected_name => self.#ident.set(dependency)
        });
        seen.push(injected_name);
    }

    let expanded = quote! {
        impl #impl_generics ::tree_injector::Inject for #name #ty_generics #where_clause {
            fn inject(&self, field: &str, dependency: ::tree_injector::Instance) -> bool {
                match field {
                    #(#arms,)*
                    _ => {
                        let _ = dependency;
                        false
                    }
                }
            }
        }
    };

    TokenStream::from(expanded)
}

/// Parsed `#[needs]` attribute
struct NeedsAttr {
    rename: Option<String>,
}

fn needs_attr(attrs: &[Attribute]) -> syn::Result<Option<NeedsAttr>> {
    let Some(attr) = attrs.iter().find(|attr| attr.path().is_ident("needs")) else {
        return Ok(None);
    };

    if attr.meta.require_path_only().is_ok() {
        return Ok(Some(NeedsAttr { rename: None }));
    }

    let mut rename = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("field") {
            let value: LitStr = meta.value()?.parse()?;
            rename = Some(value.value());
            Ok(())
        } else {
            Err(meta.error("expected `field = \"name\"`"))
        }
    })?;

    Ok(Some(NeedsAttr { rename }))
}

/// `Dependency`, possibly path-qualified
fn is_dependency(ty: &Type) -> bool {
    match ty {
        Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Dependency" && segment.arguments.is_empty()),
        _ => false,
    }
}

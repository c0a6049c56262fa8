//! `FromVariants`: `From<Inner>` for every newtype variant of an enum.

use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use std::collections::HashMap;
use syn::{Data, DeriveInput, Fields, Type};

/// Newtype variants of `data`, with the type each one wraps.
fn newtype_variants(data: &syn::DataEnum) -> impl Iterator<Item = (&syn::Variant, &Type)> {
    data.variants.iter().filter_map(|variant| match &variant.fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
            Some((variant, &fields.unnamed[0].ty))
        }
        _ => None,
    })
}

pub fn derive_from_variants_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "FromVariants can only be derived for enums",
        ));
    };
    let target = &input.ident;

    // Two variants wrapping one type would give conflicting impls.
    let mut wrapped_by = HashMap::new();
    let mut impls = TokenStream::new();
    for (variant, ty) in newtype_variants(data) {
        let key = ty.to_token_stream().to_string();
        if let Some(first) = wrapped_by.insert(key, &variant.ident) {
            return Err(syn::Error::new_spanned(
                variant,
                format!("`{first}` already wraps this type"),
            ));
        }
        let ident = &variant.ident;
        impls.extend(quote! {
            impl ::std::convert::From<#ty> for #target {
                fn from(inner: #ty) -> Self {
                    #target::#ident(inner)
                }
            }
        });
    }
    Ok(impls)
}

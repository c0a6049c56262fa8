//! Derive macros for the packet types of `minecraft-relay`.
//!
//! `Encode` and `Decode` accept `#[encoding(...)]` on fields (`varint`,
//! `bool_prefixed`, `length_prefix = "varint" | "inferred"`, `since = N`,
//! `until = N`) and, for fieldless enums, `discriminant = "varint" | "byte"`
//! on the enum plus `id = N` on each variant.

use proc_macro::TokenStream;
use syn::DeriveInput;

mod from_variants;
mod protocol;

fn expand(
    input: TokenStream,
    derive: fn(&DeriveInput) -> syn::Result<proc_macro2::TokenStream>,
) -> TokenStream {
    match syn::parse::<DeriveInput>(input) {
        Ok(input) => derive(&input).unwrap_or_else(syn::Error::into_compile_error),
        Err(e) => e.into_compile_error(),
    }
    .into()
}

#[proc_macro_derive(Encode, attributes(encoding))]
pub fn derive_encode(input: TokenStream) -> TokenStream {
    expand(input, protocol::derive_encode_on)
}

#[proc_macro_derive(Decode, attributes(encoding))]
pub fn derive_decode(input: TokenStream) -> TokenStream {
    expand(input, protocol::derive_decode_on)
}

#[proc_macro_derive(FromVariants)]
pub fn derive_from_variants(input: TokenStream) -> TokenStream {
    expand(input, from_variants::derive_from_variants_on)
}

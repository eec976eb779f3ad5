use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{parse_macro_input, FnArg, Ident, ItemFn, Pat, PatType, ReturnType, Type};

fn is_fn_trait(path: &syn::Path) -> bool {
    path.segments
        .last()
        .is_some_and(|segment| segment.ident == "Fn" || segment.ident == "FnMut" || segment.ident == "FnOnce")
}

fn bounds_are_fn_like<'a>(mut bounds: impl Iterator<Item = &'a syn::TypeParamBound>) -> bool {
    bounds.any(|bound| matches!(bound, syn::TypeParamBound::Trait(trait_bound) if is_fn_trait(&trait_bound.path)))
}

/// Closures, boxed closures and fn pointers cannot be compared or replayed by
/// a restart block.
fn is_fn_like_type(ty: &Type) -> bool {
    match ty {
        Type::ImplTrait(impl_trait) => bounds_are_fn_like(impl_trait.bounds.iter()),
        Type::BareFn(_) => true,
        Type::Path(type_path) => {
            let Some(segment) = type_path.path.segments.last() else {
                return false;
            };
            if segment.ident != "Box" && segment.ident != "Rc" {
                return false;
            }
            let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
                return false;
            };
            matches!(
                args.args.first(),
                Some(syn::GenericArgument::Type(Type::TraitObject(object)))
                    if bounds_are_fn_like(object.bounds.iter())
            )
        }
        _ => false,
    }
}

/// A generic parameter bounded by one of the `Fn` traits, inline or in the
/// where clause.
fn is_generic_fn_like(ty: &Type, generics: &syn::Generics) -> bool {
    let ident = match ty {
        Type::Path(type_path) if type_path.qself.is_none() && type_path.path.segments.len() == 1 => {
            &type_path.path.segments[0].ident
        }
        _ => return false,
    };
    let inline = generics.type_params().any(|param| {
        param.ident == *ident && bounds_are_fn_like(param.bounds.iter())
    });
    if inline {
        return true;
    }
    generics.where_clause.as_ref().is_some_and(|clause| {
        clause.predicates.iter().any(|predicate| match predicate {
            syn::WherePredicate::Type(predicate) => {
                matches!(&predicate.bounded_ty, Type::Path(bounded)
                    if bounded.path.is_ident(ident))
                    && bounds_are_fn_like(predicate.bounds.iter())
            }
            _ => false,
        })
    })
}

/// Parameters a restart block can capture: owned, comparable values.
fn is_restartable_param(ty: &Type, generics: &syn::Generics) -> bool {
    !matches!(ty, Type::ImplTrait(_) | Type::Reference(_))
        && !is_fn_like_type(ty)
        && !is_generic_fn_like(ty, generics)
}

struct ParamInfo {
    ident: Ident,
    pat: Box<Pat>,
    ty: Type,
}

/// Marks a function as composable.
///
/// When every parameter is an owned value (`Clone + PartialEq + 'static`) and
/// the function returns `()`, the body runs in a restartable group: it is
/// skipped while its parameters are unchanged and nothing it read was
/// written, and it re-runs on its own when invalidated. Other composables
/// (closure or reference parameters, return values, or `#[composable(no_skip)]`)
/// run in a plain group on every pass of their caller.
#[proc_macro_attribute]
pub fn composable(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_tokens = TokenStream2::from(attr);
    let mut enable_skip = true;
    if !attr_tokens.is_empty() {
        match syn::parse2::<Ident>(attr_tokens) {
            Ok(ident) if ident == "no_skip" => enable_skip = false,
            Ok(other) => {
                return syn::Error::new_spanned(other, "unsupported composable attribute")
                    .to_compile_error()
                    .into();
            }
            Err(err) => return err.to_compile_error().into(),
        }
    }

    let mut func = parse_macro_input!(item as ItemFn);
    if let Some(receiver) = func.sig.receiver() {
        return syn::Error::new_spanned(receiver, "composable functions cannot take self")
            .to_compile_error()
            .into();
    }

    let generics = func.sig.generics.clone();
    let returns_unit = match &func.sig.output {
        ReturnType::Default => true,
        ReturnType::Type(_, ty) => matches!(&**ty, Type::Tuple(tuple) if tuple.elems.is_empty()),
    };
    let restartable = enable_skip
        && returns_unit
        && func.sig.inputs.iter().all(|arg| match arg {
            FnArg::Typed(PatType { ty, .. }) => is_restartable_param(ty, &generics),
            FnArg::Receiver(_) => false,
        });

    let key_expr = quote! { recompose_core::location_key(file!(), line!(), column!()) };
    let block = func.block.clone();

    if !restartable {
        let return_ty: Type = match &func.sig.output {
            ReturnType::Default => syn::parse_quote! { () },
            ReturnType::Type(_, ty) => ty.as_ref().clone(),
        };
        let wrapped = quote!({
            recompose_core::with_current_composer(move |__composer: &recompose_core::Composer| {
                __composer.with_group(#key_expr, move || {
                    let __body = move || -> #return_ty #block;
                    __body()
                })
            })
        });
        func.block = Box::new(syn::parse_quote!(#wrapped));
        return TokenStream::from(quote! { #func });
    }

    let mut params: Vec<ParamInfo> = Vec::new();
    for (index, arg) in func.sig.inputs.iter_mut().enumerate() {
        if let FnArg::Typed(PatType { pat, ty, .. }) = arg {
            let ident = Ident::new(&format!("__arg{index}"), Span::call_site());
            let original = pat.clone();
            *pat = Box::new(syn::parse_quote! { #ident });
            params.push(ParamInfo {
                ident,
                pat: original,
                ty: ty.as_ref().clone(),
            });
        }
    }

    let fn_ident = func.sig.ident.clone();
    let (_, ty_generics, _) = generics.split_for_impl();
    let turbofish = ty_generics.as_turbofish();

    let change_checks: Vec<TokenStream2> = params
        .iter()
        .map(|info| {
            let ident = &info.ident;
            let ty = &info.ty;
            quote! { __changed |= __composer.changed::<#ty>(&#ident); }
        })
        .collect();
    let rebinds: Vec<TokenStream2> = params
        .iter()
        .map(|info| {
            let ident = &info.ident;
            let pat = &info.pat;
            quote! {
                #[allow(unused_mut, unused_variables)]
                let #pat = ::std::clone::Clone::clone(&#ident);
            }
        })
        .collect();
    let replay_args: Vec<TokenStream2> = params
        .iter()
        .map(|info| {
            let ident = &info.ident;
            quote! { ::std::clone::Clone::clone(&#ident) }
        })
        .collect();

    let wrapped = quote!({
        recompose_core::with_current_composer(move |__composer: &recompose_core::Composer| {
            __composer.start_restart_group(#key_expr);
            #[allow(unused_mut)]
            let mut __changed = false;
            #(#change_checks)*
            if !__changed && __composer.skipping() {
                __composer.skip_to_group_end();
            } else {
                #(#rebinds)*
                let __body = move || #block;
                __body();
            }
            if let ::std::option::Option::Some(__scope) = __composer.end_restart_group() {
                __scope.update_scope(move |_: &recompose_core::Composer| {
                    #fn_ident #turbofish (#(#replay_args),*);
                });
            }
        })
    });
    func.block = Box::new(syn::parse_quote!(#wrapped));
    TokenStream::from(quote! { #func })
}
